// Disconnect-duration guard: one `disconnect_stuck` incident per outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tether_common::types::{ConnectionState, EpochMs, IncidentKind, LinkStatus};
use tracing::warn;

use crate::incidents::{IncidentLog, RaiseOutcome};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    None,
    Raised(RaiseOutcome),
    Resolved,
}

pub struct DisconnectGuard<D> {
    incidents: Arc<IncidentLog<D>>,
    threshold_ms: i64,
    /// An incident may be open, from this process or a previous one.
    maybe_active: AtomicBool,
}

impl<D: DocumentStore> DisconnectGuard<D> {
    pub fn new(incidents: Arc<IncidentLog<D>>, threshold_ms: u64) -> Self {
        Self { incidents, threshold_ms: threshold_ms as i64, maybe_active: AtomicBool::new(true) }
    }

    pub async fn check(&self, state: &ConnectionState, now: EpochMs) -> GuardAction {
        match &state.status {
            LinkStatus::Disconnected { disconnected_since, retry_count, reason, .. } => {
                let down_ms = now - disconnected_since;
                if down_ms <= self.threshold_ms {
                    return GuardAction::None;
                }
                let evidence = json!({
                    "disconnectedSince": disconnected_since,
                    "downMs": down_ms,
                    "retryCount": retry_count,
                    "reason": reason,
                    "lastDisconnectAt": state.last_disconnect_at,
                });
                match self.incidents.raise(IncidentKind::DisconnectStuck, evidence).await {
                    Ok(outcome) => {
                        self.maybe_active.store(true, Ordering::SeqCst);
                        if outcome == RaiseOutcome::Opened {
                            warn!(down_ms, retry_count, "session disconnected for too long");
                        }
                        GuardAction::Raised(outcome)
                    }
                    Err(error) => {
                        warn!(%error, "failed to record disconnect incident");
                        GuardAction::None
                    }
                }
            }
            LinkStatus::Connected { .. } => {
                if !self.maybe_active.load(Ordering::SeqCst) {
                    return GuardAction::None;
                }
                match self.incidents.resolve(IncidentKind::DisconnectStuck).await {
                    Ok(flipped) => {
                        self.maybe_active.store(false, Ordering::SeqCst);
                        if flipped { GuardAction::Resolved } else { GuardAction::None }
                    }
                    Err(error) => {
                        warn!(%error, "failed to resolve disconnect incident");
                        GuardAction::None
                    }
                }
            }
            LinkStatus::NeedsPairing { .. } => GuardAction::None,
        }
    }
}
