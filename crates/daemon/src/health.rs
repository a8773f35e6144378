// Dependency health: consecutive durable-store failures and degraded mode.
//
// Every tracked store call reports its outcome here. Reaching the threshold
// of consecutive transient failures enters degraded mode; the next success
// leaves it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tether_common::types::EpochMs;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::store::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub consecutive_store_errors: u32,
    pub degraded_since: Option<EpochMs>,
    pub last_error: Option<String>,
}

pub struct DependencyHealth {
    threshold: u32,
    clock: SharedClock,
    state: Mutex<HealthSnapshot>,
    degraded_tx: watch::Sender<Option<EpochMs>>,
}

impl DependencyHealth {
    pub fn new(threshold: u32, clock: SharedClock) -> Self {
        let (degraded_tx, _) = watch::channel(None);
        Self { threshold: threshold.max(1), clock, state: Mutex::default(), degraded_tx }
    }

    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        let was_degraded = state.degraded_since.take();
        state.consecutive_store_errors = 0;
        state.last_error = None;
        drop(state);

        if let Some(since) = was_degraded {
            let duration_ms = self.clock.now_ms() - since;
            info!(duration_ms, "degraded_store_exit: durable store calls succeeding again");
            self.degraded_tx.send_replace(None);
        }
    }

    pub fn record_failure(&self, error: &StoreError) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.consecutive_store_errors = state.consecutive_store_errors.saturating_add(1);
        state.last_error = Some(error.to_string());
        let count = state.consecutive_store_errors;
        let entered = count >= self.threshold && state.degraded_since.is_none();
        if entered {
            state.degraded_since = Some(now);
        }
        drop(state);

        warn!(consecutive_errors = count, error = %error, "durable store call failed");
        if entered {
            warn!(threshold = self.threshold, "entering degraded mode");
            self.degraded_tx.send_replace(Some(now));
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded_since.is_some()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    /// Watch degraded-mode transitions (`Some(since)` while degraded).
    pub fn subscribe(&self) -> watch::Receiver<Option<EpochMs>> {
        self.degraded_tx.subscribe()
    }
}
