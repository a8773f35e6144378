// Core durable types: lease, connection state, outbox, dedup, incidents, auth.
//
// Every timestamp is epoch milliseconds. Documents are stored with camelCase
// field names so producers outside this workspace can write them directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Milliseconds since the Unix epoch.
pub type EpochMs = i64;

// ── Lease ───────────────────────────────────────────────────────────

/// The connection lease document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDoc {
    pub holder_instance_id: String,
    pub lease_until: EpochMs,
    pub acquired_at: EpochMs,
    pub updated_at: EpochMs,
    /// Set when an expired lease was taken over from another holder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_holder: Option<String>,
}

impl LeaseDoc {
    /// A lease is expired once `lease_until` lies strictly in the past.
    pub fn is_expired_at(&self, now: EpochMs) -> bool {
        self.lease_until < now
    }

    pub fn is_held_by(&self, instance_id: &str, now: EpochMs) -> bool {
        self.holder_instance_id == instance_id && self.lease_until > now
    }

    pub fn remaining_ms(&self, now: EpochMs) -> i64 {
        (self.lease_until - now).max(0)
    }
}

// ── Disconnect reasons ──────────────────────────────────────────────

/// Why the session socket closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DisconnectReason {
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    RestartRequired,
    TimedOut,
    MultideviceMismatch,
    /// Forced teardown after the keepalive monitor saw no socket activity.
    StaleSocket,
    /// Teardown because this instance no longer holds the lease.
    LockLost,
    Unknown(String),
}

impl DisconnectReason {
    /// Map a protocol close status code onto a reason.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Logged-out sessions never reconnect on their own.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    pub fn label(&self) -> String {
        match self {
            Self::BadSession => "bad_session".into(),
            Self::ConnectionClosed => "connection_closed".into(),
            Self::ConnectionLost => "connection_lost".into(),
            Self::ConnectionReplaced => "connection_replaced".into(),
            Self::LoggedOut => "logged_out".into(),
            Self::RestartRequired => "restart_required".into(),
            Self::TimedOut => "timed_out".into(),
            Self::MultideviceMismatch => "multidevice_mismatch".into(),
            Self::StaleSocket => "stale_socket".into(),
            Self::LockLost => "lock_lost".into(),
            Self::Unknown(raw) => format!("unknown_{raw}"),
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "bad_session" => Self::BadSession,
            "connection_closed" => Self::ConnectionClosed,
            "connection_lost" => Self::ConnectionLost,
            "connection_replaced" => Self::ConnectionReplaced,
            "logged_out" => Self::LoggedOut,
            "restart_required" => Self::RestartRequired,
            "timed_out" => Self::TimedOut,
            "multidevice_mismatch" => Self::MultideviceMismatch,
            "stale_socket" => Self::StaleSocket,
            "lock_lost" => Self::LockLost,
            other => Self::Unknown(other.strip_prefix("unknown_").unwrap_or(other).to_string()),
        }
    }
}

impl From<String> for DisconnectReason {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<DisconnectReason> for String {
    fn from(value: DisconnectReason) -> Self {
        value.label()
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

// ── Connection state ────────────────────────────────────────────────

/// Link status as an exhaustive union: retry bookkeeping only exists while
/// disconnected, so a stale `nextRetryAt` cannot sit next to CONNECTED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "waStatus",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum LinkStatus {
    Connected {
        connected_at: EpochMs,
    },
    Disconnected {
        /// `None` before the first connection attempt of this process.
        reason: Option<DisconnectReason>,
        retry_count: u32,
        next_retry_at: Option<EpochMs>,
        /// Start of the current disconnected streak.
        disconnected_since: EpochMs,
    },
    NeedsPairing {
        reason: DisconnectReason,
        since: EpochMs,
    },
}

impl LinkStatus {
    pub fn initial(now: EpochMs) -> Self {
        Self::Disconnected {
            reason: None,
            retry_count: 0,
            next_retry_at: None,
            disconnected_since: now,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "CONNECTED",
            Self::Disconnected { .. } => "DISCONNECTED",
            Self::NeedsPairing { .. } => "NEEDS_PAIRING",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn needs_pairing(&self) -> bool {
        matches!(self, Self::NeedsPairing { .. })
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Disconnected { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }
}

/// Persisted connection state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub instance_id: String,
    #[serde(flatten)]
    pub status: LinkStatus,
    #[serde(default)]
    pub last_disconnect_at: Option<EpochMs>,
    #[serde(default)]
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub updated_at: EpochMs,
}

impl ConnectionState {
    pub fn new(instance_id: impl Into<String>, now: EpochMs) -> Self {
        Self {
            instance_id: instance_id.into(),
            status: LinkStatus::initial(now),
            last_disconnect_at: None,
            last_disconnect_reason: None,
            updated_at: now,
        }
    }
}

// ── Outbox ──────────────────────────────────────────────────────────

/// Outbox entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Acked => "ACKED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "ACKED" => Some(Self::Acked),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Failed)
    }
}

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    /// Document id; not part of the stored body.
    #[serde(skip)]
    pub id: String,
    pub to: String,
    pub payload: Value,
    pub status: OutboxStatus,
    #[serde(default)]
    pub attempt_count: u32,
    pub next_attempt_at: EpochMs,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: EpochMs,
    #[serde(default)]
    pub sent_at: Option<EpochMs>,
    #[serde(default)]
    pub acked_at: Option<EpochMs>,
    #[serde(default)]
    pub wa_message_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<EpochMs>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl OutboxEntry {
    pub fn pending(
        id: impl Into<String>,
        to: impl Into<String>,
        payload: Value,
        now: EpochMs,
    ) -> Self {
        Self {
            id: id.into(),
            to: to.into(),
            payload,
            status: OutboxStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            sent_at: None,
            acked_at: None,
            wa_message_id: None,
            updated_at: Some(now),
            instance_id: None,
        }
    }
}

// ── Inbound dedup ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundDedupEntry {
    pub wa_message_id: String,
    pub first_seen_at: EpochMs,
    pub last_seen_at: EpochMs,
    #[serde(default)]
    pub instance_id: Option<String>,
}

// ── Incidents ───────────────────────────────────────────────────────

/// Incident types. Each kind owns exactly one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    PairingRequired,
    ReconnectLoop,
    DisconnectStuck,
    StoreDegraded,
    DisconnectStorm,
}

impl IncidentKind {
    pub const ALL: [IncidentKind; 5] = [
        Self::PairingRequired,
        Self::ReconnectLoop,
        Self::DisconnectStuck,
        Self::StoreDegraded,
        Self::DisconnectStorm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PairingRequired => "pairing_required",
            Self::ReconnectLoop => "reconnect_loop",
            Self::DisconnectStuck => "disconnect_stuck",
            Self::StoreDegraded => "store_degraded",
            Self::DisconnectStorm => "disconnect_storm",
        }
    }

    /// Fixed document id: repeated detections update this one document.
    pub fn doc_id(self) -> String {
        format!("{}_active", self.as_str())
    }

    pub fn instructions(self) -> &'static str {
        match self {
            Self::PairingRequired => {
                "Session logged out. Re-pair the device, then confirm the connection status."
            }
            Self::ReconnectLoop => {
                "Reconnect loop detected. The process restarts itself; if this repeats, check auth state and network."
            }
            Self::DisconnectStuck => {
                "Session disconnected for more than 10 minutes. Check logs for the disconnect reason."
            }
            Self::StoreDegraded => {
                "Durable store calls are failing. Check network and store availability."
            }
            Self::DisconnectStorm => {
                "Disconnect storm detected. Reconnects are slowed down until the cooldown ends."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    #[serde(rename = "type")]
    pub kind: IncidentKind,
    pub active: bool,
    pub first_detected_at: EpochMs,
    pub last_checked_at: EpochMs,
    #[serde(default)]
    pub resolved_at: Option<EpochMs>,
    pub instance_id: String,
    #[serde(default)]
    pub evidence: Value,
    pub instructions: String,
}

// ── Auth ────────────────────────────────────────────────────────────

/// Opaque credentials and key material for the session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthBlob {
    pub credentials: Value,
    pub keys: Value,
}

impl AuthBlob {
    pub fn fresh() -> Self {
        Self { credentials: Value::Object(Map::new()), keys: Value::Object(Map::new()) }
    }

    /// Number of stored keys across all key types.
    pub fn key_count(&self) -> usize {
        self.keys
            .as_object()
            .map(|types| {
                types.values().map(|entries| entries.as_object().map_or(0, Map::len)).sum()
            })
            .unwrap_or(0)
    }
}

impl Default for AuthBlob {
    fn default() -> Self {
        Self::fresh()
    }
}
