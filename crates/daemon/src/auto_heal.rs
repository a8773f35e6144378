// Reconnect-loop guard (auto-heal).
//
// A session that keeps failing to reconnect is restarted as a whole process:
// the guard records a `reconnect_loop` incident, hands the lease back so
// another instance (or the restarted process) can take over, and invokes the
// exit hook. It fires at most once per process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tether_common::types::{ConnectionState, EpochMs, IncidentKind, LinkStatus};
use tracing::{error, info, warn};

use crate::incidents::IncidentLog;
use crate::lease::LeaseLock;
use crate::reconnect::DisconnectRecord;
use crate::store::DocumentStore;

/// Why the process asks its supervisor for a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ReconnectLoop,
    RuntimeStall,
    ForceRestart,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReconnectLoop => "reconnect_loop",
            Self::RuntimeStall => "runtime_stall",
            Self::ForceRestart => "force_restart",
        }
    }

    /// Non-zero so the supervisor restarts the process.
    pub fn exit_code(self) -> i32 {
        1
    }
}

/// Invoked to request a controlled restart. The binary exits the process;
/// tests count calls.
pub type ExitHook = Arc<dyn Fn(ExitReason) + Send + Sync>;

pub struct ReconnectLoopGuard<D> {
    incidents: Arc<IncidentLog<D>>,
    lease: Arc<LeaseLock<D>>,
    exit: ExitHook,
    threshold: u32,
    window_ms: i64,
    fired: AtomicBool,
}

impl<D: DocumentStore> ReconnectLoopGuard<D> {
    pub fn new(
        incidents: Arc<IncidentLog<D>>,
        lease: Arc<LeaseLock<D>>,
        exit: ExitHook,
        threshold: u32,
        window_ms: u64,
    ) -> Self {
        Self { incidents, lease, exit, threshold, window_ms: window_ms as i64, fired: AtomicBool::new(false) }
    }

    /// Loop condition: enough consecutive retries, a recent disconnect, and
    /// neither connected nor waiting for pairing.
    pub fn is_looping(&self, state: &ConnectionState, now: EpochMs) -> bool {
        let LinkStatus::Disconnected { retry_count, .. } = &state.status else {
            return false;
        };
        let recent = state.last_disconnect_at.is_some_and(|at| now - at <= self.window_ms);
        *retry_count >= self.threshold && recent
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// One guard tick. Returns `true` on the tick that fired.
    pub async fn check(&self, state: &ConnectionState, history: Vec<DisconnectRecord>, now: EpochMs) -> bool {
        if self.has_fired() || !self.is_looping(state, now) {
            return false;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        let retry_count = state.status.retry_count();
        error!(retry_count, threshold = self.threshold, "reconnect loop detected, restarting");

        let evidence = json!({
            "retryCount": retry_count,
            "lastDisconnectAt": state.last_disconnect_at,
            "reason": state.last_disconnect_reason,
            "history": history,
            "instanceId": self.lease.instance_id(),
        });
        if let Err(error) = self.incidents.raise(IncidentKind::ReconnectLoop, evidence).await {
            warn!(%error, "failed to record reconnect loop incident");
        }

        match self.lease.release().await {
            Ok(outcome) => info!(?outcome, "lease released before restart"),
            Err(error) => warn!(%error, "lease release failed before restart"),
        }

        (self.exit)(ExitReason::ReconnectLoop);
        true
    }
}
