// Coordinator: decides ACTIVE vs PASSIVE and owns every background task.
//
// Task layout:
//   root group   → mode loop (lock re-validation / passive acquisition retry),
//                  degraded-mode watcher, runtime-lag sampler
//   active group → lease refresh, session loop (socket events + reconnect
//                  signals), keepalive monitor, guards, outbox worker
//
// The active group exists only while this instance holds the lease. Losing
// the lease closes the gates first (the holder flag drops inside `LeaseLock`),
// then the group is shut down and the socket torn down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tether_common::identity::InboundMessage;
use tether_common::types::{DisconnectReason, IncidentKind};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth_state::AuthStateAdapter;
use crate::auto_heal::{ExitHook, ExitReason, ReconnectLoopGuard};
use crate::circuit::DisconnectCircuit;
use crate::clock::{to_rfc3339, SharedClock};
use crate::config::CoordinatorConfig;
use crate::dedup::InboundDedup;
use crate::disconnect_guard::DisconnectGuard;
use crate::gate::{Mode, ModeGate};
use crate::health::DependencyHealth;
use crate::incidents::IncidentLog;
use crate::keepalive::KeepaliveMonitor;
use crate::lease::{AcquireOutcome, LeaseLock, ReleaseOutcome};
use crate::outbox::{OutboxPolicy, OutboxQueue, OutboxWorker};
use crate::reconnect::{BackoffPolicy, ReconnectMachine};
use crate::socket::{
    ConnectOutcome, EventSender, SessionSocket, SocketError, SocketEvent, SocketHandle,
};
use crate::status::{GateStatus, ReconnectStatus, StatusReport};
use crate::store::{DocumentStore, StoreError, TrackedStore};
use crate::tasks::TaskGroup;
use crate::watchdog::LagWatchdog;

type Tracked<D> = TrackedStore<D>;

pub struct Coordinator<D, S> {
    config: CoordinatorConfig,
    clock: SharedClock,
    instance_id: String,
    store: Arc<Tracked<D>>,
    health: Arc<DependencyHealth>,
    lease: Arc<LeaseLock<Tracked<D>>>,
    gate: Arc<ModeGate>,
    incidents: Arc<IncidentLog<Tracked<D>>>,
    auth: Arc<AuthStateAdapter<Tracked<D>>>,
    circuit: Arc<DisconnectCircuit>,
    reconnect: Arc<ReconnectMachine<Tracked<D>>>,
    socket: Arc<SocketHandle<S>>,
    keepalive: Arc<KeepaliveMonitor>,
    loop_guard: Arc<ReconnectLoopGuard<Tracked<D>>>,
    disconnect_guard: Arc<DisconnectGuard<Tracked<D>>>,
    lag: Arc<LagWatchdog>,
    outbox: Arc<OutboxQueue<Tracked<D>>>,
    worker: Arc<OutboxWorker<Tracked<D>, S>>,
    dedup: Arc<InboundDedup<Tracked<D>>>,
    exit: ExitHook,
    events_tx: EventSender,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SocketEvent>>,
    reconnect_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    reconnect_tx: mpsc::UnboundedSender<()>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    root: TaskGroup,
    active: Mutex<Option<Arc<TaskGroup>>>,
    /// Serializes activate / deactivate / shutdown.
    transition: tokio::sync::Mutex<()>,
}

impl<D: DocumentStore, S: SessionSocket> Coordinator<D, S> {
    /// Wire every component around one tracked store. First-seen inbound
    /// messages come out of the returned receiver.
    pub fn new(
        config: CoordinatorConfig,
        store: D,
        socket: Arc<S>,
        clock: SharedClock,
        exit: ExitHook,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let instance_id = config.resolve_instance_id(|key| std::env::var(key));
        let health = Arc::new(DependencyHealth::new(config.degraded_error_threshold, clock.clone()));
        let store = Arc::new(TrackedStore::new(store, health.clone(), config.store_timeout()));

        let lease = Arc::new(LeaseLock::new(
            store.clone(),
            clock.clone(),
            instance_id.clone(),
            config.lease_duration_ms,
        ));
        let gate = Arc::new(ModeGate::new(clock.clone(), lease.holder_flag(), config.warm_up_delay_ms));
        let incidents = Arc::new(IncidentLog::new(store.clone(), clock.clone(), instance_id.clone()));
        let auth = Arc::new(AuthStateAdapter::new(store.clone(), clock.clone()));
        let circuit = Arc::new(DisconnectCircuit::new(
            config.storm_threshold,
            config.storm_window_ms,
            config.storm_cooldown_ms,
        ));

        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let reconnect = Arc::new(ReconnectMachine::new(
            store.clone(),
            clock.clone(),
            instance_id.clone(),
            BackoffPolicy::from_config(&config),
            incidents.clone(),
            circuit.clone(),
            gate.clone(),
            reconnect_tx.clone(),
        ));

        let socket = Arc::new(SocketHandle::new(socket, clock.clone()));
        let keepalive = Arc::new(KeepaliveMonitor::new(config.stale_threshold_ms));
        let loop_guard = Arc::new(ReconnectLoopGuard::new(
            incidents.clone(),
            lease.clone(),
            exit.clone(),
            config.reconnect_loop_threshold,
            config.reconnect_loop_window_ms,
        ));
        let disconnect_guard =
            Arc::new(DisconnectGuard::new(incidents.clone(), config.disconnect_stuck_threshold_ms));
        let lag = Arc::new(LagWatchdog::new(
            config.lag_sample_window,
            config.lag_p95_threshold_ms,
            exit.clone(),
        ));

        let outbox = Arc::new(OutboxQueue::new(
            store.clone(),
            clock.clone(),
            OutboxPolicy::from_config(&config),
            instance_id.clone(),
        ));
        let worker = Arc::new(OutboxWorker::new(
            outbox.clone(),
            socket.clone(),
            gate.clone(),
            lease.clone(),
            health.clone(),
            clock.clone(),
            config.effective_batch_size(),
            config.min_send_interval_ms(),
        ));
        let dedup = Arc::new(InboundDedup::new(
            store.clone(),
            clock.clone(),
            gate.clone(),
            instance_id.clone(),
            config.dedup_cache_capacity,
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let coordinator = Arc::new(Self {
            config,
            clock,
            instance_id,
            store,
            health,
            lease,
            gate,
            incidents,
            auth,
            circuit,
            reconnect,
            socket,
            keepalive,
            loop_guard,
            disconnect_guard,
            lag,
            outbox,
            worker,
            dedup,
            exit,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            reconnect_rx: tokio::sync::Mutex::new(reconnect_rx),
            reconnect_tx,
            inbound_tx,
            root: TaskGroup::new("root"),
            active: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        });
        (coordinator, inbound_rx)
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ModeGate> {
        &self.gate
    }

    pub fn lease(&self) -> &Arc<LeaseLock<Tracked<D>>> {
        &self.lease
    }

    pub fn health(&self) -> &Arc<DependencyHealth> {
        &self.health
    }

    pub fn incidents(&self) -> &Arc<IncidentLog<Tracked<D>>> {
        &self.incidents
    }

    pub fn reconnect(&self) -> &Arc<ReconnectMachine<Tracked<D>>> {
        &self.reconnect
    }

    pub fn socket(&self) -> &Arc<SocketHandle<S>> {
        &self.socket
    }

    pub fn outbox(&self) -> &Arc<OutboxQueue<Tracked<D>>> {
        &self.outbox
    }

    pub fn dedup(&self) -> &Arc<InboundDedup<Tracked<D>>> {
        &self.dedup
    }

    pub fn keepalive(&self) -> &Arc<KeepaliveMonitor> {
        &self.keepalive
    }

    pub fn auth(&self) -> &Arc<AuthStateAdapter<Tracked<D>>> {
        &self.auth
    }

    /// The tracked store every component writes through.
    pub fn store(&self) -> &Arc<Tracked<D>> {
        &self.store
    }

    pub fn is_active(&self) -> bool {
        self.active_group().is_some()
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<Arc<TaskGroup>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_group(&self) -> Option<Arc<TaskGroup>> {
        self.active_slot().clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Single startup decision: try the lease once, go ACTIVE or PASSIVE,
    /// then start the root tasks. Returns the resulting mode.
    pub async fn start(self: &Arc<Self>) -> Mode {
        info!(instance_id = %self.instance_id, "coordinator starting");
        match self.lease.try_acquire().await {
            Ok(AcquireOutcome::Acquired { reason, lease_until }) => {
                info!(?reason, lease_until, "lease acquired at startup");
                self.activate().await;
            }
            Ok(AcquireOutcome::HeldByOther { holder, remaining_ms }) => {
                info!(%holder, remaining_ms, "lease held elsewhere, starting passive");
            }
            Err(error) => {
                warn!(%error, "lease acquisition failed at startup, starting passive");
            }
        }
        self.spawn_root_tasks();
        self.gate.mode()
    }

    fn spawn_root_tasks(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let lost = self.lease.lost_signal();
        self.root.spawn("mode_loop", async move {
            loop {
                let period = match this.gate.mode() {
                    Mode::Active => this.config.lock_validate_interval(),
                    _ => this.config.passive_retry_interval(),
                };
                tokio::select! {
                    _ = tokio::time::sleep(period) => this.mode_tick().await,
                    _ = lost.notified() => this.deactivate().await,
                }
            }
        });

        let this = Arc::clone(self);
        self.root.spawn("degraded_watch", async move { this.watch_degraded().await });

        let this = Arc::clone(self);
        let interval = self.config.lag_check_interval();
        self.root.spawn("lag_watchdog", async move {
            loop {
                let started = Instant::now();
                tokio::time::sleep(interval).await;
                this.lag.record(interval, started.elapsed());
            }
        });
    }

    /// ACTIVE: re-validate ownership. PASSIVE: retry acquisition.
    async fn mode_tick(self: &Arc<Self>) {
        match self.gate.mode() {
            Mode::Active => {
                if !self.lease.verify().await {
                    warn!(instance_id = %self.instance_id, "lease re-validation failed");
                    self.deactivate().await;
                }
            }
            Mode::Passive => match self.lease.try_acquire().await {
                Ok(AcquireOutcome::Acquired { reason, .. }) => {
                    info!(?reason, "lease acquired, promoting to active");
                    self.activate().await;
                }
                Ok(AcquireOutcome::HeldByOther { holder, remaining_ms }) => {
                    debug!(%holder, remaining_ms, "lease still held elsewhere");
                }
                Err(error) => debug!(%error, "passive lease retry failed"),
            },
            Mode::Stopped => {}
        }
    }

    async fn activate(self: &Arc<Self>) {
        let _turn = self.transition.lock().await;
        if self.gate.mode() == Mode::Stopped || self.is_active() {
            return;
        }
        if !self.lease.is_holder() {
            debug!("lease dropped before activation");
            return;
        }

        self.gate.activate();
        let status = self.reconnect.restore().await;
        self.drain_stale_signals().await;

        let group = Arc::new(TaskGroup::new("active"));
        *self.active_slot() = Some(group.clone());
        self.spawn_active_tasks(&group);

        info!(instance_id = %self.instance_id, status = status.label(), "coordinator active");
        if !status.needs_pairing() {
            let _ = self.reconnect_tx.send(());
        }
    }

    /// Events and reconnect signals left over from a previous active period.
    async fn drain_stale_signals(&self) {
        let mut events = self.events_rx.lock().await;
        while let Ok(event) = events.try_recv() {
            debug!(kind = event.kind(), "dropping stale socket event");
        }
        drop(events);
        let mut reconnects = self.reconnect_rx.lock().await;
        while reconnects.try_recv().is_ok() {}
    }

    fn spawn_active_tasks(self: &Arc<Self>, group: &TaskGroup) {
        let this = Arc::clone(self);
        let refresh_every = self.config.lease_refresh_interval();
        group.spawn("lease_refresh", async move {
            loop {
                tokio::time::sleep(refresh_every).await;
                if !this.lease.refresh().await {
                    break;
                }
            }
        });

        let this = Arc::clone(self);
        group.spawn("session", async move { this.session_loop().await });

        let this = Arc::clone(self);
        group.spawn_periodic("keepalive", self.config.keepalive_check_interval(), move || {
            let this = this.clone();
            async move {
                this.keepalive.tick(this.clock.now_ms(), &this.gate, &this.socket).await;
            }
        });

        let this = Arc::clone(self);
        group.spawn_periodic("guards", self.config.guard_check_interval(), move || {
            let this = this.clone();
            async move { this.guard_tick().await }
        });

        let this = Arc::clone(self);
        group.spawn_periodic("outbox", self.config.outbox_poll_interval(), move || {
            let this = this.clone();
            async move {
                let report = this.worker.run_cycle().await;
                if report.sent + report.failed + report.requeued > 0 {
                    debug!(?report, "outbox cycle");
                }
            }
        });
    }

    async fn guard_tick(&self) {
        let now = self.clock.now_ms();
        let state = self.reconnect.snapshot();
        self.loop_guard.check(&state, self.reconnect.history(), now).await;
        self.disconnect_guard.check(&state, now).await;
        self.reconnect.expire_cooldown().await;
    }

    /// Lease lost: gates are already closed by the holder flag; stop the
    /// active tasks, then tear the session down.
    async fn deactivate(&self) {
        if self.gate.mode() == Mode::Stopped {
            return;
        }
        self.gate.deactivate();
        let _turn = self.transition.lock().await;
        let group = self.active_slot().take();
        let Some(group) = group else {
            return;
        };
        group.shutdown().await;
        self.reconnect.cancel_pending();
        self.socket.end_with(DisconnectReason::LockLost).await;
        self.gate.mark_disconnected();
        warn!(instance_id = %self.instance_id, "coordinator passive after lease loss");
    }

    /// Stop everything and hand the lease back if still held. In-flight
    /// outbox entries stay in the store for the next holder.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.instance_id, "coordinator shutting down");
        self.gate.stop();
        self.root.shutdown().await;

        let _turn = self.transition.lock().await;
        let group = self.active_slot().take();
        if let Some(group) = group {
            group.shutdown().await;
        }
        self.reconnect.cancel_pending();
        self.socket.end().await;

        if self.lease.is_holder() {
            match self.lease.release().await {
                Ok(ReleaseOutcome::Released) => info!("lease released"),
                Ok(outcome) => debug!(?outcome, "lease not released"),
                Err(error) => warn!(%error, "failed to release lease on shutdown"),
            }
        }
    }

    // ── Session ─────────────────────────────────────────────────────

    async fn session_loop(&self) {
        let mut events = self.events_rx.lock().await;
        let mut reconnects = self.reconnect_rx.lock().await;
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(()) = reconnects.recv() => self.connect().await,
                else => break,
            }
        }
    }

    async fn connect(&self) {
        if !self.gate.can_start_session() {
            debug!("session gate closed, not connecting");
            return;
        }
        if self.socket.generation().is_some() {
            debug!("socket already connected");
            return;
        }
        let auth = match self.auth.load().await {
            Ok(auth) => auth,
            Err(error) => {
                warn!(%error, "could not load auth state");
                self.reconnect.on_connect_failed(&error.to_string()).await;
                return;
            }
        };
        match self.socket.connect(auth, self.events_tx.clone()).await {
            Ok(ConnectOutcome::Started) => self.keepalive.reset(self.clock.now_ms()),
            Ok(ConnectOutcome::AlreadyConnecting) => {}
            Err(error) => {
                warn!(%error, "socket connect failed");
                self.reconnect.on_connect_failed(&error.to_string()).await;
            }
        }
    }

    async fn handle_event(&self, event: SocketEvent) {
        let now = self.clock.now_ms();
        self.keepalive.record_event(now);
        match event {
            SocketEvent::Open => self.reconnect.on_open().await,
            SocketEvent::Close { reason } => {
                let reason = self.socket.on_closed(reason);
                self.reconnect.on_close(reason).await;
            }
            SocketEvent::Message(msg) => {
                self.keepalive.record_message(now);
                let verdict = self.dedup.check(&msg).await;
                if verdict.should_deliver() {
                    let _ = self.inbound_tx.send(msg);
                } else {
                    debug!(?verdict, from = %msg.from, "inbound message not delivered");
                }
            }
            SocketEvent::Ack { message_id } => match self.outbox.mark_acked(&message_id).await {
                Ok(true) => debug!(%message_id, "outbox entry acknowledged"),
                Ok(false) => debug!(%message_id, "ack for unknown or settled message"),
                Err(error) => warn!(%message_id, %error, "could not record ack"),
            },
            SocketEvent::CredentialsUpdated(blob) => {
                if let Err(error) = self.auth.save(&blob).await {
                    warn!(%error, "could not persist updated credentials");
                }
            }
        }
    }

    // ── Degraded mode ───────────────────────────────────────────────

    async fn watch_degraded(&self) {
        let mut degraded = self.health.subscribe();
        // Evidence of a degraded period whose incident could not be written
        // while the store was down.
        let mut unrecorded: Option<Value> = None;
        while degraded.changed().await.is_ok() {
            let since = *degraded.borrow_and_update();
            match since {
                Some(since) => {
                    let snapshot = self.health.snapshot();
                    let evidence = json!({
                        "degradedSince": since,
                        "consecutiveStoreErrors": snapshot.consecutive_store_errors,
                        "lastError": snapshot.last_error,
                        "instanceId": self.instance_id,
                    });
                    if let Err(error) = self.incidents.raise(IncidentKind::StoreDegraded, evidence.clone()).await {
                        debug!(%error, "store_degraded incident deferred until recovery");
                        unrecorded = Some(evidence);
                    }
                }
                None => {
                    if let Some(evidence) = unrecorded.take() {
                        if let Err(error) = self.incidents.raise(IncidentKind::StoreDegraded, evidence).await {
                            warn!(%error, "could not record store_degraded incident");
                        }
                    }
                    if let Err(error) = self.incidents.resolve(IncidentKind::StoreDegraded).await {
                        warn!(%error, "could not resolve store_degraded incident");
                    }
                }
            }
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Explicit remediation hook: ask the supervisor for a restart.
    pub fn force_restart(&self) {
        warn!(instance_id = %self.instance_id, "force restart requested");
        (self.exit)(ExitReason::ForceRestart);
    }

    /// External re-pairing finished: leave NEEDS_PAIRING and reconnect.
    pub async fn mark_paired(&self) -> bool {
        self.reconnect.mark_paired().await
    }

    /// Drop stored credentials (before pairing a new device).
    pub async fn clear_auth(&self) -> Result<(), StoreError> {
        self.auth.clear().await
    }

    /// Producer entry point; any instance may enqueue.
    pub async fn enqueue(&self, to: &str, payload: Value, idempotency_key: Option<&str>) -> Result<String, StoreError> {
        self.outbox.enqueue(to, payload, idempotency_key).await
    }

    pub async fn fetch_history(
        &self,
        jid: &str,
        count: u32,
        anchor: Option<&str>,
    ) -> Result<Vec<InboundMessage>, SocketError> {
        if !self.gate.can_process_inbound() {
            return Err(SocketError::Gated);
        }
        self.socket.fetch_history(jid, count, anchor).await
    }

    pub async fn status(&self) -> StatusReport {
        let now = self.clock.now_ms();
        let mut errors = Vec::new();
        let lock = section(&mut errors, "lock", self.lease.status().await);
        let outbox = section(&mut errors, "outbox", self.outbox.stats().await);
        let incidents = section(&mut errors, "incidents", self.incidents.active().await);
        let auth = section(&mut errors, "auth", self.auth.info().await);

        StatusReport {
            instance_id: self.instance_id.clone(),
            mode: self.gate.mode(),
            lock,
            connection: self.reconnect.snapshot(),
            gates: GateStatus {
                can_start_session: self.gate.can_start_session(),
                can_process_outbox: self.gate.can_process_outbox(),
                can_process_inbound: self.gate.can_process_inbound(),
                pairing_required: self.gate.pairing_required(),
                sends_open_at: self.gate.sends_open_at(),
            },
            reconnect: ReconnectStatus {
                mode: self.circuit.mode(now),
                cooldown_until: self.circuit.cooldown_until(now),
                recent_closes: self.circuit.recent_closes(),
                pending_reconnect: self.reconnect.has_pending_reconnect(),
                connecting: self.socket.is_connecting(),
                last_connect_attempt_at: self.socket.last_connect_attempt_at(),
                socket_generation: self.socket.generation(),
            },
            keepalive: self.keepalive.snapshot(),
            outbox,
            health: self.health.snapshot(),
            lag_p95_ms: self.lag.p95_ms(),
            incidents,
            auth,
            errors,
            generated_at: to_rfc3339(now),
        }
    }
}

fn section<T>(errors: &mut Vec<String>, name: &str, result: Result<T, StoreError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            errors.push(format!("{name}: {error}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::time::Duration;
    use crate::store::MemoryStore;
    use crate::test_support::ScriptedSocket;
    use tether_common::paths::{CONNECTION_LOCK_ID, LOCKS};
    use tether_common::types::{AuthBlob, Incident, OutboxStatus};

    struct Harness {
        coordinator: Arc<Coordinator<Arc<MemoryStore>, ScriptedSocket>>,
        store: Arc<MemoryStore>,
        socket: Arc<ScriptedSocket>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        exits: Arc<Mutex<Vec<ExitReason>>>,
    }

    fn harness_on(store: Arc<MemoryStore>, instance_id: &str) -> Harness {
        let config = CoordinatorConfig {
            instance_id: Some(instance_id.to_string()),
            backoff_jitter_ms: 0,
            ..Default::default()
        };
        let socket = ScriptedSocket::shared();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let recorded = exits.clone();
        let exit: ExitHook = Arc::new(move |reason| {
            recorded.lock().unwrap().push(reason);
        });
        let (coordinator, inbound) =
            Coordinator::new(config, store.clone(), socket.clone(), TokioClock::shared(), exit);
        Harness { coordinator, store, socket, inbound, exits }
    }

    fn harness() -> Harness {
        harness_on(Arc::new(MemoryStore::new()), "i-1")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_acquires_lease_and_connects() {
        let h = harness();
        assert_eq!(h.coordinator.start().await, Mode::Active);
        settle().await;

        assert_eq!(h.socket.connect_count(), 1);
        assert!(h.coordinator.reconnect().snapshot().status.is_connected());
        assert!(h.coordinator.gate().can_start_session());
        assert!(!h.coordinator.gate().can_process_outbox(), "warm-up still running");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.coordinator.gate().can_process_outbox());
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn held_lease_keeps_instance_passive() {
        let store = Arc::new(MemoryStore::new());
        let rival = harness_on(store.clone(), "other");
        assert!(rival.coordinator.lease().try_acquire().await.unwrap().is_acquired());

        let h = harness_on(store, "i-1");
        assert_eq!(h.coordinator.start().await, Mode::Passive);
        settle().await;
        assert!(!h.coordinator.gate().can_process_outbox());
        assert!(!h.coordinator.gate().can_start_session());
        assert_eq!(h.socket.connect_count(), 0);
        assert!(matches!(
            h.coordinator.fetch_history("jid", 10, None).await,
            Err(SocketError::Gated)
        ));
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_tears_down_session() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;
        assert_eq!(h.socket.connect_count(), 1);

        // Simulate an unnoticed expiry followed by a takeover.
        h.store.delete(LOCKS, CONNECTION_LOCK_ID).await.unwrap();
        let rival = harness_on(h.store.clone(), "other");
        assert!(rival.coordinator.lease().try_acquire().await.unwrap().is_acquired());

        tokio::time::sleep(h.coordinator.config().lease_refresh_interval() + Duration::from_millis(10)).await;

        assert_eq!(h.coordinator.gate().mode(), Mode::Passive);
        assert!(!h.coordinator.gate().can_start_session());
        assert!(!h.coordinator.is_active());
        assert_eq!(h.socket.end_count(), 1);
        assert_eq!(h.coordinator.socket().generation(), None);
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn passive_instance_takes_over_released_lease() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_on(store.clone(), "first");
        let second = harness_on(store, "second");
        assert_eq!(first.coordinator.start().await, Mode::Active);
        assert_eq!(second.coordinator.start().await, Mode::Passive);

        first.coordinator.shutdown().await;
        tokio::time::sleep(second.coordinator.config().passive_retry_interval() + Duration::from_millis(10)).await;

        assert_eq!(second.coordinator.gate().mode(), Mode::Active);
        assert_eq!(second.socket.connect_count(), 1);
        second.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_lease_and_stops() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;
        h.coordinator.shutdown().await;

        assert_eq!(h.coordinator.gate().mode(), Mode::Stopped);
        let status = h.coordinator.lease().status().await.unwrap();
        assert!(!status.exists);
        assert_eq!(h.socket.end_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_inbound_is_delivered_once() {
        let mut h = harness();
        h.coordinator.start().await;
        settle().await;

        let msg = InboundMessage::new("m-1", "+1555", "hello");
        h.socket.emit(SocketEvent::Message(msg.clone()));
        h.socket.emit(SocketEvent::Message(msg.clone()));
        settle().await;

        assert_eq!(h.inbound.try_recv().unwrap(), msg);
        assert!(h.inbound.try_recv().is_err());
        assert!(h.coordinator.keepalive().snapshot().last_message_at.is_some());
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ack_event_settles_sent_entry() {
        let h = harness();
        h.coordinator.start().await;
        let id = h.coordinator.enqueue("+1555", json!({ "text": "hi" }), None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let entry = h.coordinator.outbox().get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Sent);
        let wa_id = entry.wa_message_id.clone().unwrap();

        h.socket.emit(SocketEvent::Ack { message_id: wa_id });
        settle().await;
        let entry = h.coordinator.outbox().get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Acked);
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_close_waits_for_pairing() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;

        h.socket.emit(SocketEvent::Close { reason: DisconnectReason::LoggedOut });
        settle().await;
        assert!(h.coordinator.reconnect().snapshot().status.needs_pairing());
        assert!(!h.coordinator.gate().can_start_session());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.socket.connect_count(), 1);

        assert!(h.coordinator.mark_paired().await);
        settle().await;
        assert_eq!(h.socket.connect_count(), 2);
        assert!(h.coordinator.reconnect().snapshot().status.is_connected());
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_update_is_persisted() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;
        assert!(!h.coordinator.auth().has_auth().await.unwrap());

        let blob = AuthBlob {
            credentials: json!({ "me": "+1555" }),
            keys: json!({ "k1": "v1" }),
        };
        h.socket.emit(SocketEvent::CredentialsUpdated(blob));
        settle().await;
        assert!(h.coordinator.auth().has_auth().await.unwrap());

        h.coordinator.clear_auth().await.unwrap();
        assert!(!h.coordinator.auth().has_auth().await.unwrap());
        h.coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_store_raises_then_resolves_incident() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;

        h.store.set_offline(true);
        for _ in 0..5 {
            assert!(h.coordinator.enqueue("+1555", json!({}), None).await.is_err());
        }
        assert!(h.coordinator.health().is_degraded());
        settle().await;

        h.store.set_offline(false);
        h.coordinator.enqueue("+1555", json!({}), None).await.unwrap();
        assert!(!h.coordinator.health().is_degraded());
        settle().await;

        let incident: Incident = h
            .coordinator
            .incidents()
            .get(IncidentKind::StoreDegraded)
            .await
            .unwrap()
            .expect("incident recorded after recovery");
        assert!(!incident.active);
        assert!(incident.resolved_at.is_some());
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn force_restart_invokes_exit_hook() {
        let h = harness();
        h.coordinator.force_restart();
        assert_eq!(*h.exits.lock().unwrap(), vec![ExitReason::ForceRestart]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_active_session() {
        let h = harness();
        h.coordinator.start().await;
        settle().await;
        h.coordinator.enqueue("+1555", json!({}), None).await.unwrap();

        let report = h.coordinator.status().await;
        assert_eq!(report.mode, Mode::Active);
        assert!(report.lock.as_ref().unwrap().is_holder);
        assert!(report.connection.status.is_connected());
        assert_eq!(report.outbox.as_ref().unwrap().pending_count, 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.reconnect.socket_generation, Some(1));
        h.coordinator.shutdown().await;
    }
}
