// Shared fixtures for coordinator integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tether_common::identity::InboundMessage;
use tether_common::types::{AuthBlob, DisconnectReason};
use tether_daemon::auto_heal::{ExitHook, ExitReason};
use tether_daemon::bootstrap::Coordinator;
use tether_daemon::clock::TokioClock;
use tether_daemon::config::CoordinatorConfig;
use tether_daemon::socket::{EventSender, SendAck, SessionSocket, SocketError, SocketEvent};
use tether_daemon::store::DocumentStore;
use tokio::sync::mpsc;

/// In-process socket: connects instantly, records sends, and lets the test
/// push lifecycle events.
#[derive(Default)]
pub struct FakeSocket {
    events: Mutex<Option<EventSender>>,
    connects: AtomicUsize,
    sends: Mutex<Vec<(String, Value)>>,
    refuse_connect: AtomicBool,
}

impl FakeSocket {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sends.lock().expect("sends lock").clone()
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn emit(&self, event: SocketEvent) {
        let events = self.events.lock().expect("events lock");
        let tx = events.as_ref().expect("socket should have connected");
        tx.send(event).expect("coordinator should be listening");
    }
}

impl SessionSocket for FakeSocket {
    async fn connect(&self, _auth: AuthBlob, events: EventSender) -> Result<(), SocketError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(SocketError::Connect("connection refused".into()));
        }
        let _ = events.send(SocketEvent::Open);
        *self.events.lock().expect("events lock") = Some(events);
        Ok(())
    }

    async fn send_message(&self, to: &str, payload: &Value) -> Result<SendAck, SocketError> {
        let mut sends = self.sends.lock().expect("sends lock");
        sends.push((to.to_string(), payload.clone()));
        Ok(SendAck { message_id: format!("wa_{}", sends.len()) })
    }

    async fn fetch_history(
        &self,
        _jid: &str,
        _count: u32,
        _anchor: Option<&str>,
    ) -> Result<Vec<InboundMessage>, SocketError> {
        Ok(Vec::new())
    }

    async fn end(&self) {
        if let Some(tx) = self.events.lock().expect("events lock").take() {
            let _ = tx.send(SocketEvent::Close { reason: DisconnectReason::ConnectionClosed });
        }
    }
}

pub struct Instance<D> {
    pub coordinator: Arc<Coordinator<D, FakeSocket>>,
    pub socket: Arc<FakeSocket>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    pub exits: Arc<Mutex<Vec<ExitReason>>>,
}

impl<D: DocumentStore> Instance<D> {
    pub fn exit_reasons(&self) -> Vec<ExitReason> {
        self.exits.lock().expect("exits lock").clone()
    }
}

/// Defaults with jitter removed so backoff timing is deterministic.
pub fn config(instance_id: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        instance_id: Some(instance_id.to_string()),
        backoff_jitter_ms: 0,
        ..Default::default()
    }
}

pub fn instance<D: DocumentStore>(store: D, config: CoordinatorConfig) -> Instance<D> {
    let socket = Arc::new(FakeSocket::default());
    let exits = Arc::new(Mutex::new(Vec::new()));
    let recorded = exits.clone();
    let exit: ExitHook = Arc::new(move |reason| {
        recorded.lock().expect("exits lock").push(reason);
    });
    let (coordinator, inbound) =
        Coordinator::new(config, store, socket.clone(), TokioClock::shared(), exit);
    Instance { coordinator, socket, inbound, exits }
}

/// Let every runnable task make progress (paused-clock tests).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
