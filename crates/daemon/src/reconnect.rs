// Reconnect state machine.
//
//   open                 → CONNECTED, retryCount = 0, pending timer cancelled
//   close(logged_out)    → NEEDS_PAIRING, no further automatic reconnects
//   close(anything else) → DISCONNECTED, retryCount + 1, reconnect scheduled
//
// Every transition is persisted to `state/wa_connection`. The scheduled
// reconnect is a single timer task that signals the session loop through
// `reconnect_tx`; scheduling always aborts the previous timer first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tether_common::paths::{CONNECTION_STATE_ID, STATE};
use tether_common::types::{
    ConnectionState, DisconnectReason, EpochMs, IncidentKind, LinkStatus,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit::DisconnectCircuit;
use crate::clock::SharedClock;
use crate::config::CoordinatorConfig;
use crate::gate::ModeGate;
use crate::incidents::IncidentLog;
use crate::store::{encode, get_typed, DocumentStore, StoreError};

const HISTORY_LEN: usize = 20;

// ── Backoff ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub table_ms: Vec<u64>,
    pub cap_ms: u64,
    pub jitter_ms: u64,
}

impl BackoffPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            table_ms: config.backoff_table_ms.clone(),
            cap_ms: config.backoff_cap_ms,
            jitter_ms: config.backoff_jitter_ms,
        }
    }

    /// Delay before attempt `retry_count` (1-based), without jitter.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let idx = (retry_count.max(1) - 1) as usize;
        let step = self.table_ms.get(idx).or(self.table_ms.last()).copied().unwrap_or(self.cap_ms);
        step.min(self.cap_ms)
    }

    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let jitter = if self.jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=self.jitter_ms) };
        self.base_delay_ms(retry_count) + jitter
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

// ── Machine ─────────────────────────────────────────────────────────

/// One entry of the in-process disconnect history (evidence for incidents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRecord {
    pub at: EpochMs,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A reconnect fires after `delay_ms`.
    Scheduled { retry_count: u32, delay_ms: u64 },
    /// Automatic reconnection is stopped until the device is re-paired.
    NeedsPairing,
}

pub struct ReconnectMachine<D> {
    store: Arc<D>,
    clock: SharedClock,
    instance_id: String,
    policy: BackoffPolicy,
    incidents: Arc<IncidentLog<D>>,
    circuit: Arc<DisconnectCircuit>,
    gate: Arc<ModeGate>,
    state: Mutex<ConnectionState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    history: Mutex<VecDeque<DisconnectRecord>>,
    reconnect_tx: mpsc::UnboundedSender<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<D: DocumentStore> ReconnectMachine<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<D>,
        clock: SharedClock,
        instance_id: impl Into<String>,
        policy: BackoffPolicy,
        incidents: Arc<IncidentLog<D>>,
        circuit: Arc<DisconnectCircuit>,
        gate: Arc<ModeGate>,
        reconnect_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let instance_id = instance_id.into();
        let now = clock.now_ms();
        Self {
            state: Mutex::new(ConnectionState::new(instance_id.clone(), now)),
            store,
            clock,
            instance_id,
            policy,
            incidents,
            circuit,
            gate,
            timer: Mutex::new(None),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            reconnect_tx,
        }
    }

    pub fn snapshot(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    pub fn history(&self) -> Vec<DisconnectRecord> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.timer).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Load the persisted state on activation. A persisted NEEDS_PAIRING is
    /// kept; anything else starts a fresh streak at retryCount 0.
    pub async fn restore(&self) -> LinkStatus {
        let now = self.clock.now_ms();
        let persisted: Option<ConnectionState> =
            match get_typed(self.store.as_ref(), STATE, CONNECTION_STATE_ID).await {
                Ok(doc) => doc,
                Err(error) => {
                    warn!(%error, "could not read persisted connection state");
                    None
                }
            };

        let mut state = ConnectionState::new(self.instance_id.clone(), now);
        if let Some(prev) = persisted {
            state.last_disconnect_at = prev.last_disconnect_at;
            state.last_disconnect_reason = prev.last_disconnect_reason;
            if prev.status.needs_pairing() {
                state.status = prev.status;
            }
        }

        let pairing = state.status.needs_pairing();
        self.gate.set_pairing_required(pairing);
        if pairing {
            warn!("persisted state needs pairing, session stays down");
        }
        *lock(&self.state) = state.clone();
        self.persist(&state).await;
        state.status
    }

    pub async fn on_open(&self) {
        let now = self.clock.now_ms();
        self.cancel_pending();

        let (state, was_pairing) = {
            let mut state = lock(&self.state);
            let was_pairing = state.status.needs_pairing();
            state.status = LinkStatus::Connected { connected_at: now };
            state.instance_id = self.instance_id.clone();
            state.updated_at = now;
            (state.clone(), was_pairing)
        };
        self.gate.mark_connected(now);
        info!(instance_id = %self.instance_id, "session connected");
        self.persist(&state).await;

        if was_pairing {
            self.gate.set_pairing_required(false);
            self.resolve(IncidentKind::PairingRequired).await;
        }
    }

    pub async fn on_close(&self, reason: DisconnectReason) -> CloseOutcome {
        let now = self.clock.now_ms();
        self.gate.mark_disconnected();
        {
            let mut history = lock(&self.history);
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(DisconnectRecord { at: now, reason: reason.label() });
        }

        if reason.is_logged_out() || lock(&self.state).status.needs_pairing() {
            return self.enter_needs_pairing(reason, now).await;
        }

        if self.circuit.record_close(now) {
            let evidence = json!({
                "cooldownUntil": self.circuit.cooldown_until(now),
                "recentDisconnects": self.history(),
            });
            self.raise(IncidentKind::DisconnectStorm, evidence).await;
        }

        let (state, retry_count, delay_ms, next_retry_at) = {
            let mut state = lock(&self.state);
            let (retry_count, since) = match &state.status {
                LinkStatus::Disconnected { retry_count, disconnected_since, .. } => {
                    (retry_count + 1, *disconnected_since)
                }
                _ => (1, now),
            };
            let delay_ms = self.policy.delay_ms(retry_count);
            let next_retry_at = now + delay_ms as i64;

            state.last_disconnect_at = Some(now);
            state.last_disconnect_reason = Some(reason.clone());
            state.updated_at = now;
            state.status = LinkStatus::Disconnected {
                reason: Some(reason.clone()),
                retry_count,
                next_retry_at: Some(next_retry_at),
                disconnected_since: since,
            };
            (state.clone(), retry_count, delay_ms, next_retry_at)
        };

        warn!(%reason, retry_count, delay_ms, next_retry_at, "session disconnected, reconnect scheduled");
        self.persist(&state).await;
        self.schedule(Duration::from_millis(delay_ms));
        CloseOutcome::Scheduled { retry_count, delay_ms }
    }

    /// A connect attempt failed before the socket produced any events.
    pub async fn on_connect_failed(&self, error: &str) -> CloseOutcome {
        debug!(%error, "connect attempt failed");
        self.on_close(DisconnectReason::Unknown("connect_failed".into())).await
    }

    async fn enter_needs_pairing(&self, reason: DisconnectReason, now: EpochMs) -> CloseOutcome {
        self.cancel_pending();
        self.gate.set_pairing_required(true);

        let (state, newly) = {
            let mut state = lock(&self.state);
            let newly = !state.status.needs_pairing();
            if newly {
                state.status = LinkStatus::NeedsPairing { reason: reason.clone(), since: now };
            }
            state.last_disconnect_at = Some(now);
            state.last_disconnect_reason = Some(reason.clone());
            state.updated_at = now;
            (state.clone(), newly)
        };
        self.persist(&state).await;

        if newly {
            warn!(%reason, "session logged out, waiting for re-pairing");
            let evidence = json!({
                "reason": reason.label(),
                "loggedOutAt": now,
                "runbook": [
                    "Open the status endpoint and confirm waStatus is NEEDS_PAIRING.",
                    "Clear the stored auth state.",
                    "Pair the device again, then mark the session paired.",
                ],
            });
            self.raise(IncidentKind::PairingRequired, evidence).await;
        }
        CloseOutcome::NeedsPairing
    }

    /// External re-pairing finished: leave NEEDS_PAIRING and trigger a connect.
    pub async fn mark_paired(&self) -> bool {
        let now = self.clock.now_ms();
        let state = {
            let mut state = lock(&self.state);
            if !state.status.needs_pairing() {
                return false;
            }
            state.status = LinkStatus::initial(now);
            state.updated_at = now;
            state.clone()
        };
        self.gate.set_pairing_required(false);
        info!("session marked as paired");
        self.persist(&state).await;
        self.resolve(IncidentKind::PairingRequired).await;
        let _ = self.reconnect_tx.send(());
        true
    }

    /// Return to NORMAL once the storm cooldown has elapsed.
    pub async fn expire_cooldown(&self) -> bool {
        if !self.circuit.expire(self.clock.now_ms()) {
            return false;
        }
        info!("disconnect storm cooldown over");
        self.resolve(IncidentKind::DisconnectStorm).await;
        true
    }

    pub fn cancel_pending(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            if !handle.is_finished() {
                debug!("cancelled pending reconnect");
            }
            handle.abort();
        }
    }

    fn schedule(&self, delay: Duration) {
        self.cancel_pending();
        let tx = self.reconnect_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
        *lock(&self.timer) = Some(handle);
    }

    async fn persist(&self, state: &ConnectionState) {
        let result = match encode(STATE, CONNECTION_STATE_ID, state) {
            Ok(body) => self.store.set(STATE, CONNECTION_STATE_ID, body).await,
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            warn!(%error, status = state.status.label(), "failed to persist connection state");
        }
    }

    async fn raise(&self, kind: IncidentKind, evidence: serde_json::Value) {
        if let Err(error) = self.incidents.raise(kind, evidence).await {
            warn!(%error, incident = kind.as_str(), "failed to raise incident");
        }
    }

    async fn resolve(&self, kind: IncidentKind) {
        if let Err(error) = self.incidents.resolve(kind).await {
            warn!(%error, incident = kind.as_str(), "failed to resolve incident");
        }
    }

    /// Read the persisted document (status surface and tests).
    pub async fn persisted(&self) -> Result<Option<ConnectionState>, StoreError> {
        get_typed(self.store.as_ref(), STATE, CONNECTION_STATE_ID).await
    }
}

impl<D> Drop for ReconnectMachine<D> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}
