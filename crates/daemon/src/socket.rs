// Session socket seam.
//
// The chat-protocol client lives outside this crate; `SessionSocket` is the
// surface the coordinator drives. `SocketHandle` wraps a socket with the
// per-process rules: one connect in flight at a time, and one outstanding
// request per connection (a FIFO lane owned by that connection).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tether_common::identity::InboundMessage;
use tether_common::types::{AuthBlob, DisconnectReason, EpochMs};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::SharedClock;

// ── Collaborator surface ────────────────────────────────────────────

/// Lifecycle and data events emitted by a connected socket, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Open,
    Close { reason: DisconnectReason },
    Message(InboundMessage),
    /// Delivery acknowledgement for a previously sent message.
    Ack { message_id: String },
    /// The client rotated credentials or keys; persist them.
    CredentialsUpdated(AuthBlob),
}

impl SocketEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close { .. } => "close",
            Self::Message(_) => "message",
            Self::Ack { .. } => "ack",
            Self::CredentialsUpdated(_) => "credentials_updated",
        }
    }
}

/// Transport acknowledgement of an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub message_id: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SocketError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("session gate is closed on this instance")]
    Gated,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("history fetch failed: {0}")]
    History(String),
}

pub type EventSender = mpsc::UnboundedSender<SocketEvent>;

/// The chat-protocol client. Trait-based so tests can script it.
pub trait SessionSocket: Send + Sync + 'static {
    /// Start a connection. Lifecycle events for it are delivered on `events`.
    fn connect(
        &self,
        auth: AuthBlob,
        events: EventSender,
    ) -> impl std::future::Future<Output = Result<(), SocketError>> + Send;

    fn send_message(
        &self,
        to: &str,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<SendAck, SocketError>> + Send;

    fn fetch_history(
        &self,
        jid: &str,
        count: u32,
        anchor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<InboundMessage>, SocketError>> + Send;

    /// Tear the connection down. The client reports the resulting close as
    /// a `Close` event.
    fn end(&self) -> impl std::future::Future<Output = ()> + Send;
}

// ── Handle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    /// Another connect was already running; this request was dropped.
    AlreadyConnecting,
}

/// One live connection and its request lane.
struct Link {
    generation: u64,
    lane: tokio::sync::Mutex<()>,
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SocketHandle<S> {
    socket: Arc<S>,
    clock: SharedClock,
    connecting: AtomicBool,
    generations: AtomicU64,
    link: Mutex<Option<Arc<Link>>>,
    close_override: Mutex<Option<DisconnectReason>>,
    last_connect_attempt_at: Mutex<Option<EpochMs>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: SessionSocket> SocketHandle<S> {
    pub fn new(socket: Arc<S>, clock: SharedClock) -> Self {
        Self {
            socket,
            clock,
            connecting: AtomicBool::new(false),
            generations: AtomicU64::new(0),
            link: Mutex::new(None),
            close_override: Mutex::new(None),
            last_connect_attempt_at: Mutex::new(None),
        }
    }

    pub fn socket(&self) -> &Arc<S> {
        &self.socket
    }

    /// Single-flight connect.
    pub async fn connect(
        &self,
        auth: AuthBlob,
        events: EventSender,
    ) -> Result<ConnectOutcome, SocketError> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("connect already in progress, dropping request");
            return Ok(ConnectOutcome::AlreadyConnecting);
        }
        let _guard = ConnectingGuard(&self.connecting);
        *lock(&self.last_connect_attempt_at) = Some(self.clock.now_ms());
        *lock(&self.close_override) = None;

        self.socket.connect(auth, events).await?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.link) =
            Some(Arc::new(Link { generation, lane: tokio::sync::Mutex::new(()) }));
        info!(generation, "session socket connecting");
        Ok(ConnectOutcome::Started)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub fn last_connect_attempt_at(&self) -> Option<EpochMs> {
        *lock(&self.last_connect_attempt_at)
    }

    /// Generation of the live connection, if any.
    pub fn generation(&self) -> Option<u64> {
        lock(&self.link).as_ref().map(|link| link.generation)
    }

    fn current(&self) -> Result<Arc<Link>, SocketError> {
        lock(&self.link).clone().ok_or(SocketError::NotConnected)
    }

    /// Sends and history fetches on one connection share a lane and run one
    /// at a time, in call order.
    pub async fn send_message(&self, to: &str, payload: &Value) -> Result<SendAck, SocketError> {
        let link = self.current()?;
        let _turn = link.lane.lock().await;
        self.socket.send_message(to, payload).await
    }

    pub async fn fetch_history(
        &self,
        jid: &str,
        count: u32,
        anchor: Option<&str>,
    ) -> Result<Vec<InboundMessage>, SocketError> {
        let link = self.current()?;
        let _turn = link.lane.lock().await;
        self.socket.fetch_history(jid, count, anchor).await
    }

    pub async fn end(&self) {
        let link = lock(&self.link).take();
        if link.is_some() {
            self.socket.end().await;
        }
    }

    /// Tear down and make the resulting close report `reason`.
    pub async fn end_with(&self, reason: DisconnectReason) {
        *lock(&self.close_override) = Some(reason);
        self.end().await;
    }

    /// Called for each `Close` event: drops the link and resolves the
    /// effective reason.
    pub fn on_closed(&self, reported: DisconnectReason) -> DisconnectReason {
        lock(&self.link).take();
        lock(&self.close_override).take().unwrap_or(reported)
    }
}

// ── Dry-run transport ───────────────────────────────────────────────

/// Transport used when no wire adapter is linked: connects immediately,
/// accepts every send and logs it.
#[derive(Debug, Default)]
pub struct DryRunSocket {
    events: Mutex<Option<EventSender>>,
}

impl DryRunSocket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionSocket for DryRunSocket {
    async fn connect(&self, _auth: AuthBlob, events: EventSender) -> Result<(), SocketError> {
        let _ = events.send(SocketEvent::Open);
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn send_message(&self, to: &str, payload: &Value) -> Result<SendAck, SocketError> {
        let message_id = format!("dry_{}", Uuid::new_v4().simple());
        info!(%to, %message_id, payload = %payload, "dry-run send");
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(SocketEvent::Ack { message_id: message_id.clone() });
        }
        Ok(SendAck { message_id })
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
        if let Some(events) = lock(&self.events).take() {
            let _ = events.send(SocketEvent::Close { reason: DisconnectReason::ConnectionClosed });
        }
    }
}
