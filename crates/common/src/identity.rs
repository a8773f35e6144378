// Message identity: stable dedup keys for inbound messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::EpochMs;

/// Which side produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// An inbound message as delivered by the session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Transport-assigned message id. Some events arrive without one.
    #[serde(default)]
    pub id: Option<String>,
    pub from: String,
    pub direction: Direction,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timestamp_ms: Option<EpochMs>,
    #[serde(default)]
    pub raw: Value,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            from: from.into(),
            direction: Direction::Inbound,
            body: Some(body.into()),
            timestamp_ms: None,
            raw: Value::Null,
        }
    }
}

const FINGERPRINT_PREFIX: &str = "fp_";
const FINGERPRINT_HEX_LEN: usize = 40;

/// Dedup key for a message: its transport id when present, otherwise a content
/// fingerprint over direction, normalized body and timestamp.
pub fn dedup_key(msg: &InboundMessage) -> String {
    match msg.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => fingerprint(msg),
    }
}

fn fingerprint(msg: &InboundMessage) -> String {
    let body = normalize_body(msg.body.as_deref().unwrap_or_default());
    let ts = msg.timestamp_ms.map(|t| t.to_string()).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(msg.direction.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(body.as_bytes());
    hasher.update(b"|");
    hasher.update(ts.as_bytes());
    let digest = hasher.finalize();

    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(FINGERPRINT_HEX_LEN);
    format!("{FINGERPRINT_PREFIX}{hex}")
}

/// Outbox document id for a producer-supplied idempotency key. The same key
/// always maps to the same id, so a repeated enqueue finds the first entry.
pub fn outbox_id_for_key(key: &str) -> String {
    let digest = Sha256::digest(key.trim().as_bytes());
    let hex: String = digest.iter().take(12).map(|b| format!("{b:02x}")).collect();
    format!("idem_{hex}")
}

/// Trim and collapse runs of whitespace to a single space.
pub fn normalize_body(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}
