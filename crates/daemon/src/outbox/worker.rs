// Outbox delivery worker: one polling cycle drains due entries while every
// gate is open.
//
// Cycle order: gate check, degraded check, ack-timeout requeue, due batch,
// then per entry a fresh gate check, lease fencing, rate limit and send.
// Nothing is buffered in memory; a skipped entry is simply picked up again by
// a later cycle.

use std::sync::{Arc, Mutex, PoisonError};

use tether_common::types::EpochMs;
use tracing::{debug, info, warn};

use super::queue::{FailOutcome, OutboxQueue};
use crate::clock::SharedClock;
use crate::gate::ModeGate;
use crate::health::DependencyHealth;
use crate::lease::LeaseLock;
use crate::socket::{SessionSocket, SocketHandle};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSkip {
    /// Outbox gate closed (passive, pairing, warm-up or disconnected).
    Gated,
    Degraded,
    /// Lease ownership could not be confirmed before a send.
    Fenced,
    StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub requeued: usize,
    pub sent: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub skipped: Option<CycleSkip>,
}

pub struct OutboxWorker<D, S> {
    queue: Arc<OutboxQueue<D>>,
    socket: Arc<SocketHandle<S>>,
    gate: Arc<ModeGate>,
    lease: Arc<LeaseLock<D>>,
    health: Arc<DependencyHealth>,
    clock: SharedClock,
    batch_size: usize,
    min_send_interval_ms: i64,
    last_send_at: Mutex<Option<EpochMs>>,
}

impl<D: DocumentStore, S: SessionSocket> OutboxWorker<D, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OutboxQueue<D>>,
        socket: Arc<SocketHandle<S>>,
        gate: Arc<ModeGate>,
        lease: Arc<LeaseLock<D>>,
        health: Arc<DependencyHealth>,
        clock: SharedClock,
        batch_size: usize,
        min_send_interval_ms: i64,
    ) -> Self {
        Self {
            queue,
            socket,
            gate,
            lease,
            health,
            clock,
            batch_size: batch_size.max(1),
            min_send_interval_ms,
            last_send_at: Mutex::new(None),
        }
    }

    fn rate_limited(&self, now: EpochMs) -> bool {
        let last = *self.last_send_at.lock().unwrap_or_else(PoisonError::into_inner);
        last.is_some_and(|at| now - at < self.min_send_interval_ms)
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if !self.gate.can_process_outbox() {
            report.skipped = Some(CycleSkip::Gated);
            return report;
        }
        if self.health.is_degraded() {
            debug!("store degraded, skipping outbox cycle");
            report.skipped = Some(CycleSkip::Degraded);
            return report;
        }

        match self.queue.requeue_stale_sent().await {
            Ok(n) => report.requeued = n,
            Err(error) => warn!(%error, "ack-timeout requeue failed"),
        }

        let due = match self.queue.due(self.clock.now_ms(), self.batch_size).await {
            Ok(due) => due,
            Err(error) => {
                warn!(%error, "failed to load due outbox entries");
                report.skipped = Some(CycleSkip::StoreError);
                return report;
            }
        };

        for entry in due {
            if !self.gate.can_process_outbox() {
                report.skipped = Some(CycleSkip::Gated);
                break;
            }
            if !self.lease.verify().await {
                warn!(id = %entry.id, "lease not confirmed before send, aborting outbox cycle");
                report.skipped = Some(CycleSkip::Fenced);
                break;
            }
            let now = self.clock.now_ms();
            if self.rate_limited(now) {
                report.rate_limited += 1;
                continue;
            }

            *self.last_send_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
            match self.socket.send_message(&entry.to, &entry.payload).await {
                Ok(ack) => {
                    match self.queue.mark_sent(&entry.id, &ack.message_id).await {
                        Ok(true) => info!(id = %entry.id, wa_message_id = %ack.message_id, "outbox entry sent"),
                        Ok(false) => debug!(id = %entry.id, "outbox entry changed while sending"),
                        Err(error) => warn!(id = %entry.id, %error, "sent but could not record it"),
                    }
                    report.sent += 1;
                }
                Err(send_error) => {
                    report.failed += 1;
                    match self.queue.mark_failed(&entry.id, &send_error.to_string()).await {
                        Ok(FailOutcome::Retry { attempt_count, next_attempt_at }) => {
                            warn!(id = %entry.id, attempt_count, next_attempt_at, error = %send_error, "outbox send failed, will retry");
                        }
                        Ok(_) => {}
                        Err(error) => warn!(id = %entry.id, %error, "could not record send failure"),
                    }
                }
            }
        }
        report
    }
}
