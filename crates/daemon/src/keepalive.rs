// Keepalive / stale-socket monitor.
//
// The transport can look open while the protocol underneath is dead. Every
// socket event stamps `lastEventAt`; a periodic check tears the socket down
// when nothing has arrived for longer than the stale threshold. The teardown
// surfaces as a `stale_socket` close in the reconnect machine.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use tether_common::types::{DisconnectReason, EpochMs};
use tracing::warn;

use crate::gate::ModeGate;
use crate::socket::{SessionSocket, SocketHandle};

// Never recorded. Epoch 0 is a valid timestamp under a manual clock.
const UNSET: EpochMs = EpochMs::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveSnapshot {
    pub last_event_at: Option<EpochMs>,
    pub last_message_at: Option<EpochMs>,
    pub stale_threshold_ms: i64,
}

pub struct KeepaliveMonitor {
    stale_threshold_ms: i64,
    last_event_at: AtomicI64,
    last_message_at: AtomicI64,
}

fn read(slot: &AtomicI64) -> Option<EpochMs> {
    Some(slot.load(Ordering::SeqCst)).filter(|at| *at != UNSET)
}

impl KeepaliveMonitor {
    pub fn new(stale_threshold_ms: u64) -> Self {
        Self {
            stale_threshold_ms: stale_threshold_ms as i64,
            last_event_at: AtomicI64::new(UNSET),
            last_message_at: AtomicI64::new(UNSET),
        }
    }

    pub fn record_event(&self, now: EpochMs) {
        self.last_event_at.store(now, Ordering::SeqCst);
    }

    pub fn record_message(&self, now: EpochMs) {
        self.last_event_at.store(now, Ordering::SeqCst);
        self.last_message_at.store(now, Ordering::SeqCst);
    }

    /// Start a fresh observation window (new connection).
    pub fn reset(&self, now: EpochMs) {
        self.last_event_at.store(now, Ordering::SeqCst);
        self.last_message_at.store(UNSET, Ordering::SeqCst);
    }

    /// Idle time when the socket is stale, `None` otherwise.
    pub fn check(&self, now: EpochMs) -> Option<i64> {
        let last = read(&self.last_event_at)?;
        let idle = now - last;
        (idle > self.stale_threshold_ms).then_some(idle)
    }

    /// One monitor tick. Returns `true` when a teardown was forced.
    pub async fn tick<S: SessionSocket>(&self, now: EpochMs, gate: &ModeGate, socket: &SocketHandle<S>) -> bool {
        if !gate.can_start_session() || socket.generation().is_none() {
            return false;
        }
        let Some(idle_ms) = self.check(now) else {
            return false;
        };
        warn!(idle_ms, last_message_at = ?read(&self.last_message_at), "socket stale, forcing teardown");
        // Restart the window so the next tick does not fire again before the
        // close has been processed.
        self.reset(now);
        socket.end_with(DisconnectReason::StaleSocket).await;
        true
    }

    pub fn snapshot(&self) -> KeepaliveSnapshot {
        KeepaliveSnapshot {
            last_event_at: read(&self.last_event_at),
            last_message_at: read(&self.last_message_at),
            stale_threshold_ms: self.stale_threshold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::ScriptedSocket;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tether_common::types::AuthBlob;
    use tokio::sync::mpsc;

    #[test]
    fn no_events_is_never_stale() {
        let monitor = KeepaliveMonitor::new(300_000);
        assert_eq!(monitor.check(10_000_000), None);
    }

    #[test]
    fn event_at_epoch_zero_is_tracked() {
        let monitor = KeepaliveMonitor::new(300_000);
        monitor.reset(0);
        assert_eq!(monitor.snapshot().last_event_at, Some(0));
        assert_eq!(monitor.snapshot().last_message_at, None);
        assert_eq!(monitor.check(300_001), Some(300_001));
    }

    #[test]
    fn stale_only_past_threshold() {
        let monitor = KeepaliveMonitor::new(300_000);
        monitor.record_event(1_000);
        assert_eq!(monitor.check(301_000), None);
        assert_eq!(monitor.check(301_001), Some(300_001));

        monitor.record_message(300_000);
        assert_eq!(monitor.check(301_001), None);
        assert_eq!(monitor.snapshot().last_message_at, Some(300_000));
    }

    #[tokio::test]
    async fn tick_tears_down_stale_socket_once() {
        let clock = ManualClock::new(0);
        let gate = ModeGate::new(clock.clone(), Arc::new(AtomicBool::new(true)), 0);
        gate.activate();
        let socket = Arc::new(ScriptedSocket::new());
        let handle = SocketHandle::new(socket.clone(), clock.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle.connect(AuthBlob::fresh(), tx).await.unwrap();

        let monitor = KeepaliveMonitor::new(300_000);
        monitor.reset(0);
        assert!(!monitor.tick(200_000, &gate, &handle).await);
        assert!(monitor.tick(400_000, &gate, &handle).await);
        assert_eq!(socket.end_count(), 1);
        assert!(!monitor.tick(400_001, &gate, &handle).await);

        // The close event the socket emits resolves to the stale reason.
        let reported = loop {
            match rx.recv().await {
                Some(crate::socket::SocketEvent::Close { reason }) => break reason,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };
        assert_eq!(handle.on_closed(reported), DisconnectReason::StaleSocket);
    }

    #[tokio::test]
    async fn tick_is_gated() {
        let clock = ManualClock::new(0);
        let gate = ModeGate::new(clock.clone(), Arc::new(AtomicBool::new(true)), 0);
        let socket = Arc::new(ScriptedSocket::new());
        let handle = SocketHandle::new(socket.clone(), clock.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        handle.connect(AuthBlob::fresh(), tx).await.unwrap();

        let monitor = KeepaliveMonitor::new(1_000);
        monitor.reset(0);
        assert!(!monitor.tick(10_000, &gate, &handle).await, "passive gate");
        assert_eq!(socket.end_count(), 0);
    }
}
