mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, instance, settle};
use serde_json::json;
use tether_common::identity::InboundMessage;
use tether_common::types::{DisconnectReason, IncidentKind, LinkStatus, OutboxStatus};
use tether_daemon::auto_heal::ExitReason;
use tether_daemon::dedup::{DedupVerdict, DuplicateSource};
use tether_daemon::gate::Mode;
use tether_daemon::lease::LeaseLock;
use tether_daemon::clock::TokioClock;
use tether_daemon::socket::SocketEvent;
use tether_daemon::store::MemoryStore;

#[tokio::test(start_paused = true)]
async fn instance_stays_passive_while_another_holds_a_live_lease() {
    let store = Arc::new(MemoryStore::new());
    let other = LeaseLock::new(store.clone(), TokioClock::shared(), "other", 60_000);
    assert!(other.try_acquire().await.expect("rival acquire should succeed").is_acquired());

    let node = instance(store, config("node-a"));
    assert_eq!(node.coordinator.start().await, Mode::Passive);
    settle().await;

    let gate = node.coordinator.gate();
    assert!(!gate.can_process_outbox());
    assert!(!gate.can_start_session());
    assert!(!gate.can_process_inbound());
    assert_eq!(node.socket.connect_count(), 0, "passive instance must not start a socket");

    let status = node.coordinator.status().await;
    assert_eq!(status.mode, Mode::Passive);
    let lock = status.lock.expect("lock status should be readable");
    assert_eq!(lock.holder.as_deref(), Some("other"));
    assert!(!lock.is_holder);

    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn open_event_resets_retry_count_and_cancels_pending_reconnect() {
    let node = instance(MemoryStore::new(), config("node-a"));
    node.coordinator.start().await;
    settle().await;
    assert_eq!(node.socket.connect_count(), 1);

    node.socket.emit(SocketEvent::Close { reason: DisconnectReason::ConnectionLost });
    settle().await;
    let reconnect = node.coordinator.reconnect();
    match reconnect.snapshot().status {
        LinkStatus::Disconnected { retry_count, next_retry_at, .. } => {
            assert_eq!(retry_count, 1);
            assert!(next_retry_at.is_some());
        }
        other => panic!("expected DISCONNECTED, got {other:?}"),
    }
    assert!(reconnect.has_pending_reconnect());

    node.socket.emit(SocketEvent::Open);
    settle().await;
    let state = reconnect.snapshot();
    assert!(state.status.is_connected());
    assert_eq!(state.status.retry_count(), 0);
    assert!(!reconnect.has_pending_reconnect());

    let persisted = reconnect
        .persisted()
        .await
        .expect("state read should succeed")
        .expect("state should be persisted");
    assert!(persisted.status.is_connected());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(node.socket.connect_count(), 1, "cancelled timer must not reconnect");
    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_loop_guard_fires_exactly_once() {
    let node = instance(MemoryStore::new(), config("node-a"));
    node.socket.refuse_connect(true);
    node.coordinator.start().await;

    tokio::time::sleep(Duration::from_secs(9 * 60)).await;

    assert!(node.socket.connect_count() >= 11, "connect attempts: {}", node.socket.connect_count());
    assert_eq!(node.exit_reasons(), vec![ExitReason::ReconnectLoop]);

    let incident = node
        .coordinator
        .incidents()
        .get(IncidentKind::ReconnectLoop)
        .await
        .expect("incident read should succeed")
        .expect("reconnect_loop incident should exist");
    assert!(incident.active);
    assert!(incident.evidence["retryCount"].as_u64().unwrap_or(0) >= 10);
    assert!(incident.evidence["history"].as_array().is_some_and(|h| !h.is_empty()));

    let loops = node
        .coordinator
        .incidents()
        .active()
        .await
        .expect("active incidents should load")
        .into_iter()
        .filter(|i| i.kind == IncidentKind::ReconnectLoop)
        .count();
    assert_eq!(loops, 1);
    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_socket_is_torn_down_as_stale_and_reconnected() {
    let node = instance(MemoryStore::new(), config("node-a"));
    node.coordinator.start().await;
    settle().await;
    assert_eq!(node.socket.connect_count(), 1);

    // No events for longer than the stale threshold; the first keepalive tick
    // past it forces a teardown.
    let cfg = node.coordinator.config();
    let past_threshold = Duration::from_millis(cfg.stale_threshold_ms) + cfg.keepalive_check_interval();
    tokio::time::sleep(past_threshold + Duration::from_secs(5)).await;

    assert_eq!(node.socket.connect_count(), 2, "stale socket should be replaced");
    let state = node.coordinator.reconnect().snapshot();
    assert!(state.status.is_connected());
    assert_eq!(state.last_disconnect_reason, Some(DisconnectReason::StaleSocket));
    assert!(node.exit_reasons().is_empty());
    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn outbox_entry_is_sent_within_one_poll_interval() {
    let node = instance(MemoryStore::new(), config("node-a"));
    node.coordinator.start().await;
    let id = node
        .coordinator
        .enqueue("+1555", json!({ "text": "hi" }), None)
        .await
        .expect("enqueue should succeed");

    let poll = node.coordinator.config().outbox_poll_interval();
    tokio::time::sleep(poll + Duration::from_millis(100)).await;

    let entry = node
        .coordinator
        .outbox()
        .get(&id)
        .await
        .expect("entry read should succeed")
        .expect("entry should exist");
    assert_eq!(entry.status, OutboxStatus::Sent);
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(node.socket.sent(), vec![("+1555".to_string(), json!({ "text": "hi" }))]);
    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicate_checks_yield_one_first_seen() {
    let node = instance(MemoryStore::new(), config("node-a"));
    node.coordinator.start().await;
    settle().await;

    let msg = InboundMessage::new("3EB0C0FFEE", "+1555", "hello");
    let mut checks = Vec::new();
    for _ in 0..16 {
        let dedup = node.coordinator.dedup().clone();
        let msg = msg.clone();
        checks.push(tokio::spawn(async move { dedup.check(&msg).await }));
    }

    let mut first_seen = 0;
    for check in checks {
        match check.await.expect("dedup task should not panic") {
            DedupVerdict::FirstSeen => first_seen += 1,
            DedupVerdict::Duplicate(DuplicateSource::Cache | DuplicateSource::Store) => {}
            other => panic!("unexpected verdict {other:?}"),
        }
    }
    assert_eq!(first_seen, 1);
    node.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn logged_out_session_needs_pairing_across_restarts() {
    let store = Arc::new(MemoryStore::new());
    let first = instance(store.clone(), config("node-a"));
    first.coordinator.start().await;
    settle().await;

    first.socket.emit(SocketEvent::Close { reason: DisconnectReason::LoggedOut });
    settle().await;
    assert!(first.coordinator.reconnect().snapshot().status.needs_pairing());
    assert!(!first.coordinator.reconnect().has_pending_reconnect());

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(first.socket.connect_count(), 1, "no automatic reconnect after logout");
    let incident = first
        .coordinator
        .incidents()
        .get(IncidentKind::PairingRequired)
        .await
        .expect("incident read should succeed")
        .expect("pairing incident should exist");
    assert!(incident.active);
    first.coordinator.shutdown().await;

    let second = instance(store, config("node-b"));
    assert_eq!(second.coordinator.start().await, Mode::Active);
    settle().await;
    assert!(second.coordinator.gate().pairing_required());
    assert_eq!(second.socket.connect_count(), 0);

    assert!(second.coordinator.mark_paired().await);
    settle().await;
    assert_eq!(second.socket.connect_count(), 1);
    assert!(second.coordinator.reconnect().snapshot().status.is_connected());
    let incident = second
        .coordinator
        .incidents()
        .get(IncidentKind::PairingRequired)
        .await
        .expect("incident read should succeed")
        .expect("pairing incident should still exist");
    assert!(!incident.active);
    second.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn long_disconnect_keeps_one_incident_and_resolves_once() {
    let mut cfg = config("node-a");
    cfg.reconnect_loop_threshold = 1_000;
    let node = instance(MemoryStore::new(), cfg);
    node.socket.refuse_connect(true);
    node.coordinator.start().await;

    tokio::time::sleep(Duration::from_secs(11 * 60 + 1)).await;
    let incidents = node.coordinator.incidents();
    let raised = incidents
        .get(IncidentKind::DisconnectStuck)
        .await
        .expect("incident read should succeed")
        .expect("disconnect incident should exist");
    assert!(raised.active);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let still = incidents
        .get(IncidentKind::DisconnectStuck)
        .await
        .expect("incident read should succeed")
        .expect("disconnect incident should exist");
    assert_eq!(still.first_detected_at, raised.first_detected_at);
    assert!(still.last_checked_at > raised.last_checked_at);

    node.socket.refuse_connect(false);
    tokio::time::sleep(Duration::from_secs(180)).await;
    let resolved = incidents
        .get(IncidentKind::DisconnectStuck)
        .await
        .expect("incident read should succeed")
        .expect("disconnect incident should exist");
    assert!(!resolved.active);
    let resolved_at = resolved.resolved_at.expect("resolvedAt should be set");

    tokio::time::sleep(Duration::from_secs(180)).await;
    let later = incidents
        .get(IncidentKind::DisconnectStuck)
        .await
        .expect("incident read should succeed")
        .expect("disconnect incident should exist");
    assert_eq!(later.resolved_at, Some(resolved_at), "resolution is written once");
    assert!(node.exit_reasons().is_empty());
    node.coordinator.shutdown().await;
}
