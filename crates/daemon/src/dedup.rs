// Inbound dedup: two-tier first-seen detection.
//
// Tier 1 is a bounded process-local set evicted in insertion order (not LRU;
// a hit does not refresh an entry's position). Tier 2 is a transactional
// create-or-touch on `inbound_dedup/<key>`: under contention exactly one
// caller creates the document, every other caller sees it as a duplicate.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tether_common::identity::{dedup_key, InboundMessage};
use tether_common::paths::INBOUND_DEDUP;
use tether_common::types::{EpochMs, InboundDedupEntry};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::gate::ModeGate;
use crate::store::{encode, DocumentStore, StoreError, TxnWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateSource {
    Cache,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    FirstSeen,
    Duplicate(DuplicateSource),
    /// The durable check failed. The message is delivered anyway
    /// (at-least-once); consumers must be idempotent.
    Unverified,
    /// Inbound processing is closed on this instance.
    Gated,
}

impl DedupVerdict {
    /// Whether the message should be handed to consumers.
    pub fn should_deliver(self) -> bool {
        matches!(self, Self::FirstSeen | Self::Unverified)
    }
}

/// Bounded set with insertion-order eviction.
struct SeenCache {
    capacity: usize,
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), keys: HashSet::new(), order: VecDeque::new() }
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: String) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct InboundDedup<D> {
    store: Arc<D>,
    clock: SharedClock,
    gate: Arc<ModeGate>,
    instance_id: String,
    cache: Mutex<SeenCache>,
}

impl<D: DocumentStore> InboundDedup<D> {
    pub fn new(
        store: Arc<D>,
        clock: SharedClock,
        gate: Arc<ModeGate>,
        instance_id: impl Into<String>,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            clock,
            gate,
            instance_id: instance_id.into(),
            cache: Mutex::new(SeenCache::new(capacity)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, SeenCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }

    pub async fn check(&self, msg: &InboundMessage) -> DedupVerdict {
        if !self.gate.can_process_inbound() {
            return DedupVerdict::Gated;
        }
        self.check_key(&dedup_key(msg)).await
    }

    pub async fn check_key(&self, key: &str) -> DedupVerdict {
        if self.cache().contains(key) {
            debug!(key, "duplicate inbound message (cache)");
            return DedupVerdict::Duplicate(DuplicateSource::Cache);
        }

        match self.claim(key).await {
            Ok(true) => {
                self.cache().insert(key.to_string());
                DedupVerdict::FirstSeen
            }
            Ok(false) => {
                debug!(key, "duplicate inbound message (store)");
                DedupVerdict::Duplicate(DuplicateSource::Store)
            }
            Err(error) => {
                warn!(key, %error, "dedup check failed, delivering unverified");
                DedupVerdict::Unverified
            }
        }
    }

    /// Create the dedup document, or touch `lastSeenAt` when it exists.
    /// Returns `true` for the creating call.
    async fn claim(&self, key: &str) -> Result<bool, StoreError> {
        let now: EpochMs = self.clock.now_ms();
        let id = key.to_string();
        let instance_id = self.instance_id.clone();

        self.store
            .transact(INBOUND_DEDUP, key, move |current| match current {
                None => {
                    let entry = InboundDedupEntry {
                        wa_message_id: id.clone(),
                        first_seen_at: now,
                        last_seen_at: now,
                        instance_id: Some(instance_id),
                    };
                    Ok((TxnWrite::Put(encode(INBOUND_DEDUP, &id, &entry)?), true))
                }
                Some(raw) => {
                    let mut entry: InboundDedupEntry = serde_json::from_value(raw)
                        .map_err(|e| StoreError::corrupt(INBOUND_DEDUP, &id, e))?;
                    entry.last_seen_at = now;
                    Ok((TxnWrite::Put(encode(INBOUND_DEDUP, &id, &entry)?), false))
                }
            })
            .await
    }
}
