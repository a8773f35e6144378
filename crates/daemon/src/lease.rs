// Connection lease: single active instance across the deployment.
//
// The lease is one document (`locks/wa_connection`) updated only inside
// single-document transactions. The holder refreshes it periodically; any
// refresh that does not come back as "held by us" drops the local holder flag
// before anything else happens, which closes every gate reading that flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tether_common::paths::{CONNECTION_LOCK_ID, LOCKS};
use tether_common::types::{EpochMs, LeaseDoc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::store::{encode, get_typed, DocumentStore, StoreError, TxnWrite};

// ── Outcomes ────────────────────────────────────────────────────────

/// Why an acquire succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireReason {
    NoExistingLock,
    ExpiredLockTaken { previous_holder: String },
    RefreshedOwnLock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { reason: AcquireReason, lease_until: EpochMs },
    /// Another instance holds a live lease. Not an error: this instance
    /// stays passive.
    HeldByOther { holder: String, remaining_ms: i64 },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The document names another holder; left untouched.
    NotHolder,
    Absent,
}

/// Durable view of the lease as seen by this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    pub exists: bool,
    pub holder: Option<String>,
    pub lease_until: Option<EpochMs>,
    pub is_expired: bool,
    pub is_holder: bool,
    pub remaining_ms: i64,
}

// ── Lease lock ──────────────────────────────────────────────────────

pub struct LeaseLock<D> {
    store: Arc<D>,
    clock: SharedClock,
    instance_id: String,
    lease_duration_ms: i64,
    holding: Arc<AtomicBool>,
    lost: Arc<Notify>,
}

impl<D: DocumentStore> LeaseLock<D> {
    pub fn new(
        store: Arc<D>,
        clock: SharedClock,
        instance_id: impl Into<String>,
        lease_duration_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
            lease_duration_ms: lease_duration_ms as i64,
            holding: Arc::new(AtomicBool::new(false)),
            lost: Arc::new(Notify::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Local belief that this instance holds the lease.
    pub fn is_holder(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    /// Shared holder flag read by the mode gate.
    pub fn holder_flag(&self) -> Arc<AtomicBool> {
        self.holding.clone()
    }

    /// Notified whenever a held lease is lost.
    pub fn lost_signal(&self) -> Arc<Notify> {
        self.lost.clone()
    }

    /// Transactional acquire-or-refresh.
    pub async fn try_acquire(&self) -> Result<AcquireOutcome, StoreError> {
        let now = self.clock.now_ms();
        let me = self.instance_id.clone();
        let lease_until = now + self.lease_duration_ms;

        let result = self
            .store
            .transact(LOCKS, CONNECTION_LOCK_ID, move |current| {
                let existing: Option<LeaseDoc> = current
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| StoreError::corrupt(LOCKS, CONNECTION_LOCK_ID, e))?;

                let (doc, reason) = match existing {
                    None => (
                        LeaseDoc {
                            holder_instance_id: me,
                            lease_until,
                            acquired_at: now,
                            updated_at: now,
                            previous_holder: None,
                        },
                        AcquireReason::NoExistingLock,
                    ),
                    Some(lease) if lease.holder_instance_id == me => (
                        LeaseDoc { lease_until, updated_at: now, ..lease },
                        AcquireReason::RefreshedOwnLock,
                    ),
                    Some(lease) if lease.is_expired_at(now) => {
                        let previous = lease.holder_instance_id;
                        (
                            LeaseDoc {
                                holder_instance_id: me,
                                lease_until,
                                acquired_at: now,
                                updated_at: now,
                                previous_holder: Some(previous.clone()),
                            },
                            AcquireReason::ExpiredLockTaken { previous_holder: previous },
                        )
                    }
                    Some(lease) => {
                        let remaining_ms = lease.remaining_ms(now);
                        return Ok((
                            TxnWrite::Keep,
                            AcquireOutcome::HeldByOther {
                                holder: lease.holder_instance_id,
                                remaining_ms,
                            },
                        ));
                    }
                };
                let body = encode(LOCKS, CONNECTION_LOCK_ID, &doc)?;
                Ok((TxnWrite::Put(body), AcquireOutcome::Acquired { reason, lease_until }))
            })
            .await;

        match &result {
            Ok(AcquireOutcome::Acquired { reason, lease_until }) => {
                let was_holder = self.holding.swap(true, Ordering::SeqCst);
                match reason {
                    AcquireReason::RefreshedOwnLock if was_holder => {
                        debug!(instance_id = %self.instance_id, lease_until, "lease refreshed");
                    }
                    AcquireReason::ExpiredLockTaken { previous_holder } => {
                        info!(instance_id = %self.instance_id, %previous_holder, "took over expired lease");
                    }
                    _ => info!(instance_id = %self.instance_id, lease_until, "lease acquired"),
                }
            }
            Ok(AcquireOutcome::HeldByOther { holder, remaining_ms }) => {
                self.mark_lost();
                debug!(instance_id = %self.instance_id, %holder, remaining_ms, "lease held by another instance");
            }
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "lease acquire failed");
                self.mark_lost();
            }
        }
        result
    }

    /// Periodic refresh. Anything other than a successful re-acquire marks
    /// the lease lost and returns `false`.
    pub async fn refresh(&self) -> bool {
        match self.try_acquire().await {
            Ok(AcquireOutcome::Acquired { .. }) => true,
            Ok(AcquireOutcome::HeldByOther { holder, .. }) => {
                warn!(instance_id = %self.instance_id, %holder, "lease taken by another instance");
                false
            }
            Err(_) => false,
        }
    }

    /// Read-only ownership check against the durable document. A failed read
    /// counts as not holding.
    pub async fn verify(&self) -> bool {
        match self.status().await {
            Ok(status) if status.is_holder => true,
            Ok(_) => {
                if self.is_holder() {
                    self.mark_lost();
                }
                false
            }
            Err(e) => {
                warn!(instance_id = %self.instance_id, error = %e, "lease verification failed");
                if self.is_holder() {
                    self.mark_lost();
                }
                false
            }
        }
    }

    /// Drop the holder flag and wake whoever tears the session down.
    pub fn mark_lost(&self) {
        if self.holding.swap(false, Ordering::SeqCst) {
            warn!(instance_id = %self.instance_id, "lease lost");
            self.lost.notify_one();
        }
    }

    /// Transactional release: deletes the document only while it still
    /// names this instance.
    pub async fn release(&self) -> Result<ReleaseOutcome, StoreError> {
        self.holding.store(false, Ordering::SeqCst);
        let me = self.instance_id.clone();

        let outcome = self
            .store
            .transact(LOCKS, CONNECTION_LOCK_ID, move |current| {
                let Some(raw) = current else {
                    return Ok((TxnWrite::Keep, ReleaseOutcome::Absent));
                };
                let lease: LeaseDoc = serde_json::from_value(raw)
                    .map_err(|e| StoreError::corrupt(LOCKS, CONNECTION_LOCK_ID, e))?;
                if lease.holder_instance_id == me {
                    Ok((TxnWrite::Delete, ReleaseOutcome::Released))
                } else {
                    Ok((TxnWrite::Keep, ReleaseOutcome::NotHolder))
                }
            })
            .await?;

        match outcome {
            ReleaseOutcome::Released => info!(instance_id = %self.instance_id, "lease released"),
            ReleaseOutcome::NotHolder => {
                debug!(instance_id = %self.instance_id, "lease held by another instance, not released")
            }
            ReleaseOutcome::Absent => debug!(instance_id = %self.instance_id, "no lease to release"),
        }
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<LeaseStatus, StoreError> {
        let now = self.clock.now_ms();
        let lease: Option<LeaseDoc> =
            get_typed(self.store.as_ref(), LOCKS, CONNECTION_LOCK_ID).await?;
        Ok(match lease {
            Some(lease) => LeaseStatus {
                exists: true,
                is_expired: lease.is_expired_at(now),
                is_holder: lease.is_held_by(&self.instance_id, now),
                remaining_ms: lease.remaining_ms(now),
                lease_until: Some(lease.lease_until),
                holder: Some(lease.holder_instance_id),
            },
            None => LeaseStatus {
                exists: false,
                holder: None,
                lease_until: None,
                is_expired: false,
                is_holder: false,
                remaining_ms: 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const LEASE_MS: u64 = 90_000;

    fn pair() -> (LeaseLock<MemoryStore>, LeaseLock<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000_000);
        let a = LeaseLock::new(store.clone(), clock.clone(), "a", LEASE_MS);
        let b = LeaseLock::new(store, clock.clone(), "b", LEASE_MS);
        (a, b, clock)
    }

    #[tokio::test]
    async fn first_acquire_creates_lease() {
        let (a, _, _) = pair();
        let outcome = a.try_acquire().await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Acquired {
                reason: AcquireReason::NoExistingLock,
                lease_until: 1_000_000 + 90_000
            }
        );
        assert!(a.is_holder());
    }

    #[tokio::test]
    async fn second_instance_is_denied_with_remaining_time() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();
        clock.advance(30_000);
        let outcome = b.try_acquire().await.unwrap();
        assert_eq!(outcome, AcquireOutcome::HeldByOther { holder: "a".into(), remaining_ms: 60_000 });
        assert!(!b.is_holder());
    }

    #[tokio::test]
    async fn takeover_only_after_lease_until_elapses() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();

        clock.advance(90_000);
        assert!(!b.try_acquire().await.unwrap().is_acquired(), "lease still live at leaseUntil");

        clock.advance(1);
        let outcome = b.try_acquire().await.unwrap();
        assert!(matches!(
            outcome,
            AcquireOutcome::Acquired {
                reason: AcquireReason::ExpiredLockTaken { ref previous_holder },
                ..
            } if previous_holder == "a"
        ));

        let status = b.status().await.unwrap();
        assert!(status.is_holder);
        assert_eq!(status.holder.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn refresh_extends_own_lease() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();
        clock.advance(30_000);
        assert!(a.refresh().await);
        clock.advance(70_000);
        assert!(!b.try_acquire().await.unwrap().is_acquired());
        assert_eq!(a.status().await.unwrap().remaining_ms, 20_000);
    }

    #[tokio::test]
    async fn refresh_after_takeover_marks_lost() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();
        let lost = a.lost_signal();

        clock.advance(90_001);
        b.try_acquire().await.unwrap();

        assert!(!a.refresh().await);
        assert!(!a.is_holder());
        // The permit is stored, so a late waiter still sees the loss.
        tokio::time::timeout(std::time::Duration::from_millis(50), lost.notified())
            .await
            .expect("lost signal should be delivered");
    }

    #[tokio::test]
    async fn refresh_error_fails_closed() {
        let store = Arc::new(MemoryStore::new());
        let a = LeaseLock::new(store.clone(), ManualClock::new(0), "a", LEASE_MS);
        a.try_acquire().await.unwrap();
        store.inject_failures(1);
        assert!(!a.refresh().await);
        assert!(!a.is_holder());
    }

    #[tokio::test]
    async fn release_only_deletes_own_lease() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();
        clock.advance(90_001);
        b.try_acquire().await.unwrap();

        assert_eq!(a.release().await.unwrap(), ReleaseOutcome::NotHolder);
        assert!(b.status().await.unwrap().is_holder);

        assert_eq!(b.release().await.unwrap(), ReleaseOutcome::Released);
        assert!(!b.status().await.unwrap().exists);
        assert_eq!(b.release().await.unwrap(), ReleaseOutcome::Absent);
    }

    #[tokio::test]
    async fn verify_detects_foreign_holder() {
        let (a, b, clock) = pair();
        a.try_acquire().await.unwrap();
        assert!(a.verify().await);

        clock.advance(90_001);
        b.try_acquire().await.unwrap();
        assert!(!a.verify().await);
        assert!(!a.is_holder());
    }

    #[tokio::test]
    async fn contention_never_yields_two_live_holders() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(0);
        let locks: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| LeaseLock::new(store.clone(), clock.clone(), *id, LEASE_MS))
            .collect();

        // Holders refresh irregularly; time advances in uneven steps.
        for step in 0..200u64 {
            let lock = &locks[(step * 7 % 3) as usize];
            if step % 5 != 0 {
                let _ = lock.try_acquire().await.unwrap();
            }
            clock.advance(((step * 13) % 40_000) as i64);

            let mut live = 0;
            for lock in &locks {
                let status = lock.status().await.unwrap();
                if status.is_holder {
                    live += 1;
                }
            }
            assert!(live <= 1, "two live holders at step {step}");
        }
    }
}
