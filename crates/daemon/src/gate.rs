// Mode gate: the three predicates every session, send and receive path
// consults before doing work.
//
// The lease holder flag is shared with `LeaseLock`, so a lost lease closes the
// gates the moment the flag drops, ahead of any teardown.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tether_common::types::EpochMs;
use tokio::sync::watch;
use tracing::info;

use crate::clock::SharedClock;

/// Operating mode of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No lease held: no socket, no sends, no inbound processing.
    Passive,
    Active,
    Stopped,
}

const NEVER: EpochMs = EpochMs::MAX;

pub struct ModeGate {
    clock: SharedClock,
    lease_held: Arc<AtomicBool>,
    active: AtomicBool,
    pairing_required: AtomicBool,
    warm_up_ms: i64,
    /// Sends open at this instant; `NEVER` until a connection opens.
    sends_open_at: AtomicI64,
    mode_tx: watch::Sender<Mode>,
}

impl ModeGate {
    pub fn new(clock: SharedClock, lease_held: Arc<AtomicBool>, warm_up_ms: u64) -> Self {
        let (mode_tx, _) = watch::channel(Mode::Passive);
        Self {
            clock,
            lease_held,
            active: AtomicBool::new(false),
            pairing_required: AtomicBool::new(false),
            warm_up_ms: warm_up_ms as i64,
            sends_open_at: AtomicI64::new(NEVER),
            mode_tx,
        }
    }

    // ── Predicates ──────────────────────────────────────────────────

    fn holds_session(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self.lease_held.load(Ordering::SeqCst)
            && !self.pairing_required.load(Ordering::SeqCst)
    }

    pub fn can_start_session(&self) -> bool {
        self.holds_session()
    }

    pub fn can_process_inbound(&self) -> bool {
        self.holds_session()
    }

    /// Sends additionally wait out the warm-up period after each connect.
    pub fn can_process_outbox(&self) -> bool {
        self.holds_session() && self.clock.now_ms() >= self.sends_open_at.load(Ordering::SeqCst)
    }

    // ── Transitions ─────────────────────────────────────────────────

    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("mode gate: active");
        }
        self.mode_tx.send_replace(Mode::Active);
    }

    /// Close every gate. Runs before any teardown work.
    pub fn deactivate(&self) {
        self.sends_open_at.store(NEVER, Ordering::SeqCst);
        if self.active.swap(false, Ordering::SeqCst) {
            info!("mode gate: passive");
        }
        self.mode_tx.send_replace(Mode::Passive);
    }

    pub fn stop(&self) {
        self.sends_open_at.store(NEVER, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.mode_tx.send_replace(Mode::Stopped);
    }

    pub fn set_pairing_required(&self, required: bool) {
        self.pairing_required.store(required, Ordering::SeqCst);
    }

    pub fn pairing_required(&self) -> bool {
        self.pairing_required.load(Ordering::SeqCst)
    }

    /// A connection opened: sends resume after the warm-up delay.
    pub fn mark_connected(&self, now: EpochMs) {
        self.sends_open_at.store(now.saturating_add(self.warm_up_ms), Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.sends_open_at.store(NEVER, Ordering::SeqCst);
    }

    /// When sends open, if a connection is up.
    pub fn sends_open_at(&self) -> Option<EpochMs> {
        Some(self.sends_open_at.load(Ordering::SeqCst)).filter(|at| *at != NEVER)
    }

    pub fn mode(&self) -> Mode {
        *self.mode_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }
}
