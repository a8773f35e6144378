// Durable outbox queue over the `outbox` collection.
//
// Entries move through a state machine:
//   PENDING → SENT → ACKED      (happy path)
//   SENT → PENDING              (no ack within the ack timeout)
//   PENDING → PENDING           (send failure, retried with backoff)
//   PENDING → FAILED            (after `max_attempts` failures)
//
// Every transition is a single-document transaction guarded on the current
// status, so a stale worker view can never move an entry backwards.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tether_common::identity::outbox_id_for_key;
use tether_common::paths::OUTBOX;
use tether_common::types::{EpochMs, OutboxEntry, OutboxStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::CoordinatorConfig;
use crate::store::{encode, get_typed, Document, DocumentStore, FilterOp, Query, StoreError, TxnWrite};

/// `lastError` recorded when an unacknowledged entry is put back in line.
pub const ACK_TIMEOUT_ERROR: &str = "ack_timeout";
const REQUEUE_BATCH: usize = 5;

// ── Policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxPolicy {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_attempts: u32,
    pub ack_timeout_ms: u64,
}

impl OutboxPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            backoff_base_ms: config.outbox_backoff_base_ms,
            backoff_cap_ms: config.outbox_backoff_cap_ms,
            max_attempts: config.outbox_max_attempts,
            ack_timeout_ms: config.outbox_ack_timeout_ms,
        }
    }

    /// Delay after a failure, given the attempts made before it.
    pub fn backoff_ms(&self, prior_attempts: u32) -> u64 {
        let exp = prior_attempts.min(32);
        self.backoff_base_ms.saturating_mul(1u64 << exp).min(self.backoff_cap_ms)
    }
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Stays PENDING until `next_attempt_at`.
    Retry { attempt_count: u32, next_attempt_at: EpochMs },
    /// Out of attempts; terminal.
    Failed { attempt_count: u32 },
    /// The entry was no longer PENDING.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStats {
    pub pending_count: usize,
    pub oldest_pending_age_ms: Option<i64>,
    pub awaiting_ack_count: usize,
    pub failed_count: usize,
}

// ── Queue ───────────────────────────────────────────────────────────

pub struct OutboxQueue<D> {
    store: Arc<D>,
    clock: SharedClock,
    policy: OutboxPolicy,
    instance_id: String,
}

fn decode_entry(doc: &Document) -> Result<OutboxEntry, StoreError> {
    let mut entry: OutboxEntry = doc.decode(OUTBOX)?;
    entry.id = doc.id.clone();
    Ok(entry)
}

fn decode_raw(id: &str, raw: Value) -> Result<OutboxEntry, StoreError> {
    let mut entry: OutboxEntry =
        serde_json::from_value(raw).map_err(|e| StoreError::corrupt(OUTBOX, id, e))?;
    entry.id = id.to_string();
    Ok(entry)
}

impl<D: DocumentStore> OutboxQueue<D> {
    pub fn new(store: Arc<D>, clock: SharedClock, policy: OutboxPolicy, instance_id: impl Into<String>) -> Self {
        Self { store, clock, policy, instance_id: instance_id.into() }
    }

    pub fn policy(&self) -> &OutboxPolicy {
        &self.policy
    }

    /// Queue a message. With an idempotency key, a repeated enqueue returns
    /// the id of the existing entry instead of queueing a second copy.
    pub async fn enqueue(&self, to: &str, payload: Value, idempotency_key: Option<&str>) -> Result<String, StoreError> {
        let now = self.clock.now_ms();
        let id = match idempotency_key {
            Some(key) => outbox_id_for_key(key),
            None => format!("msg_{}", Uuid::new_v4().simple()),
        };
        let entry = OutboxEntry::pending(id.clone(), to, payload, now);

        match self.store.create(OUTBOX, &id, encode(OUTBOX, &id, &entry)?).await {
            Ok(()) => {
                debug!(%id, %to, "outbox entry queued");
                Ok(id)
            }
            Err(e) if e.is_already_exists() && idempotency_key.is_some() => {
                debug!(%id, "outbox entry already queued for idempotency key");
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        let entry: Option<OutboxEntry> = get_typed(self.store.as_ref(), OUTBOX, id).await?;
        Ok(entry.map(|mut entry| {
            entry.id = id.to_string();
            entry
        }))
    }

    /// PENDING entries due at `now`, earliest `nextAttemptAt` first.
    pub async fn due(&self, now: EpochMs, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let query = Query::new()
            .filter("status", FilterOp::Eq, OutboxStatus::Pending.as_str())
            .filter("nextAttemptAt", FilterOp::Lte, now)
            .order_by("nextAttemptAt")
            .limit(limit);
        let docs = self.store.query(OUTBOX, query).await?;
        docs.iter().map(decode_entry).collect()
    }

    /// PENDING → SENT. Returns `false` when the entry had already moved on.
    pub async fn mark_sent(&self, id: &str, wa_message_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let entry_id = id.to_string();
        let wa_id = wa_message_id.to_string();
        let instance_id = self.instance_id.clone();

        self.store
            .transact(OUTBOX, id, move |current| {
                let Some(raw) = current else {
                    return Ok((TxnWrite::Keep, false));
                };
                let mut entry = decode_raw(&entry_id, raw)?;
                if entry.status != OutboxStatus::Pending {
                    return Ok((TxnWrite::Keep, false));
                }
                entry.status = OutboxStatus::Sent;
                entry.attempt_count += 1;
                entry.sent_at = Some(now);
                entry.wa_message_id = Some(wa_id);
                entry.last_error = None;
                entry.updated_at = Some(now);
                entry.instance_id = Some(instance_id);
                Ok((TxnWrite::Put(encode(OUTBOX, &entry_id, &entry)?), true))
            })
            .await
    }

    /// Record a failed send: retry with backoff, or FAILED when out of attempts.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<FailOutcome, StoreError> {
        let now = self.clock.now_ms();
        let entry_id = id.to_string();
        let error = error.to_string();
        let policy = self.policy;
        let instance_id = self.instance_id.clone();

        let outcome = self
            .store
            .transact(OUTBOX, id, move |current| {
                let Some(raw) = current else {
                    return Ok((TxnWrite::Keep, FailOutcome::Skipped));
                };
                let mut entry = decode_raw(&entry_id, raw)?;
                if entry.status != OutboxStatus::Pending {
                    return Ok((TxnWrite::Keep, FailOutcome::Skipped));
                }
                let prior = entry.attempt_count;
                entry.attempt_count = prior + 1;
                entry.last_error = Some(error);
                entry.updated_at = Some(now);
                entry.instance_id = Some(instance_id);

                let outcome = if entry.attempt_count >= policy.max_attempts {
                    entry.status = OutboxStatus::Failed;
                    FailOutcome::Failed { attempt_count: entry.attempt_count }
                } else {
                    entry.next_attempt_at = now + policy.backoff_ms(prior) as i64;
                    FailOutcome::Retry {
                        attempt_count: entry.attempt_count,
                        next_attempt_at: entry.next_attempt_at,
                    }
                };
                Ok((TxnWrite::Put(encode(OUTBOX, &entry_id, &entry)?), outcome))
            })
            .await?;

        if let FailOutcome::Failed { attempt_count } = outcome {
            warn!(%id, attempt_count, "outbox entry failed permanently");
        }
        Ok(outcome)
    }

    /// SENT → ACKED for the entry carrying `wa_message_id`.
    pub async fn mark_acked(&self, wa_message_id: &str) -> Result<bool, StoreError> {
        let query = Query::new()
            .filter("waMessageId", FilterOp::Eq, wa_message_id)
            .filter("status", FilterOp::Eq, OutboxStatus::Sent.as_str())
            .limit(1);
        let Some(doc) = self.store.query(OUTBOX, query).await?.into_iter().next() else {
            debug!(%wa_message_id, "ack for unknown or settled message");
            return Ok(false);
        };

        let now = self.clock.now_ms();
        let entry_id = doc.id.clone();
        self.store
            .transact(OUTBOX, &doc.id, move |current| {
                let Some(raw) = current else {
                    return Ok((TxnWrite::Keep, false));
                };
                let mut entry = decode_raw(&entry_id, raw)?;
                if entry.status != OutboxStatus::Sent {
                    return Ok((TxnWrite::Keep, false));
                }
                entry.status = OutboxStatus::Acked;
                entry.acked_at = Some(now);
                entry.updated_at = Some(now);
                Ok((TxnWrite::Put(encode(OUTBOX, &entry_id, &entry)?), true))
            })
            .await
    }

    /// Put SENT entries that never got an ack back in line.
    pub async fn requeue_stale_sent(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let cutoff = now - self.policy.ack_timeout_ms as i64;
        let query = Query::new()
            .filter("status", FilterOp::Eq, OutboxStatus::Sent.as_str())
            .filter("sentAt", FilterOp::Lte, cutoff)
            .order_by("sentAt")
            .limit(REQUEUE_BATCH);
        let stale = self.store.query(OUTBOX, query).await?;

        let mut requeued = 0;
        for doc in stale {
            let entry_id = doc.id.clone();
            let moved = self
                .store
                .transact(OUTBOX, &doc.id, move |current| {
                    let Some(raw) = current else {
                        return Ok((TxnWrite::Keep, false));
                    };
                    let mut entry = decode_raw(&entry_id, raw)?;
                    let expired = entry.sent_at.is_some_and(|at| at <= cutoff);
                    if entry.status != OutboxStatus::Sent || !expired {
                        return Ok((TxnWrite::Keep, false));
                    }
                    entry.status = OutboxStatus::Pending;
                    entry.next_attempt_at = now;
                    entry.last_error = Some(ACK_TIMEOUT_ERROR.to_string());
                    entry.updated_at = Some(now);
                    Ok((TxnWrite::Put(encode(OUTBOX, &entry_id, &entry)?), true))
                })
                .await?;
            if moved {
                requeued += 1;
            }
        }
        if requeued > 0 {
            info!(requeued, "requeued outbox entries without ack");
        }
        Ok(requeued)
    }

    pub async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let now = self.clock.now_ms();
        let by_status = |status: OutboxStatus| Query::new().filter("status", FilterOp::Eq, status.as_str());

        let pending = self.store.query(OUTBOX, by_status(OutboxStatus::Pending).order_by("createdAt")).await?;
        let oldest_pending_age_ms = match pending.first() {
            Some(doc) => Some(now - decode_entry(doc)?.created_at),
            None => None,
        };
        let awaiting_ack_count = self.store.query(OUTBOX, by_status(OutboxStatus::Sent)).await?.len();
        let failed_count = self.store.query(OUTBOX, by_status(OutboxStatus::Failed)).await?.len();

        Ok(OutboxStats { pending_count: pending.len(), oldest_pending_age_ms, awaiting_ack_count, failed_count })
    }
}
