// Scripted socket for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tether_common::identity::InboundMessage;
use tether_common::types::{AuthBlob, DisconnectReason};

use crate::socket::{EventSender, SendAck, SessionSocket, SocketError, SocketEvent};

#[derive(Default)]
pub struct ScriptedSocket {
    events: Mutex<Option<EventSender>>,
    connects: AtomicUsize,
    ends: AtomicUsize,
    sends: Mutex<Vec<(String, Value)>>,
    fail_sends: AtomicUsize,
    fail_connect: AtomicBool,
    hold_open: AtomicBool,
}

impl ScriptedSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn end_count(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sends.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Do not emit `Open` on connect; the test emits lifecycle events itself.
    pub fn hold_open(&self) {
        self.hold_open.store(true, Ordering::SeqCst);
    }

    /// Push an event into the live connection.
    pub fn emit(&self, event: SocketEvent) -> bool {
        match self.events.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl SessionSocket for ScriptedSocket {
    async fn connect(&self, _auth: AuthBlob, events: EventSender) -> Result<(), SocketError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SocketError::Connect("scripted connect failure".into()));
        }
        if !self.hold_open.load(Ordering::SeqCst) {
            let _ = events.send(SocketEvent::Open);
        }
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
        Ok(())
    }

    async fn send_message(&self, to: &str, payload: &Value) -> Result<SendAck, SocketError> {
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SocketError::Send("scripted send failure".into()));
        }
        let mut sends = self.sends.lock().unwrap_or_else(PoisonError::into_inner);
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
        self.ends.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(SocketEvent::Close { reason: DisconnectReason::ConnectionClosed });
        }
    }
}
