// Durable document layout: collection names and well-known document ids.

/// Single-document lease lock.
pub const LOCKS: &str = "locks";
/// Persisted connection state.
pub const STATE: &str = "state";
/// Outbound delivery queue, written by producers and drained by the holder.
pub const OUTBOX: &str = "outbox";
/// First-seen records for inbound messages.
pub const INBOUND_DEDUP: &str = "inbound_dedup";
/// One document per incident kind.
pub const INCIDENTS: &str = "incidents";
/// Opaque session credentials and keys.
pub const AUTH: &str = "auth";

/// Id of the connection lock document inside [`LOCKS`].
pub const CONNECTION_LOCK_ID: &str = "wa_connection";
/// Id of the connection state document inside [`STATE`].
pub const CONNECTION_STATE_ID: &str = "wa_connection";
/// Id of the credentials document inside [`AUTH`].
pub const AUTH_CREDS_ID: &str = "creds";
/// Id of the signal keys document inside [`AUTH`].
pub const AUTH_KEYS_ID: &str = "keys";
