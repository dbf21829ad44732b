use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// An immutable event record stored in the log.
///
/// The log assigns `local_id` (monotonic from 1, gap-free under normal
/// operation) and `global_id` (a fresh time-sortable UUIDv7 token) at
/// append time. The `payload` field is intentionally untyped
/// ([`serde_json::Value`]) — the log has no opinion about event shapes;
/// fold functions give events meaning.
///
/// # Examples
///
/// ```
/// use tallylog::Event;
/// use serde_json::json;
///
/// let event = Event {
///     local_id: 1,
///     global_id: "0192d5b0-0000-7000-8000-000000000000".to_string(),
///     ts: 1700000000,
///     payload: json!({"track": "t-1", "action": "played"}),
/// };
/// assert_eq!(event.local_id, 1);
/// assert_eq!(event.payload["action"], "played");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Log-local sequence number, assigned starting at 1.
    pub local_id: u64,

    /// Globally unique, roughly time-sortable token. Unique across the
    /// whole log; a collision fails the append.
    pub global_id: String,

    /// Unix timestamp in seconds, recorded at append.
    pub ts: u64,

    /// Arbitrary JSON payload. The log does not validate this — folds
    /// interpret it however they need.
    pub payload: Value,
}

/// Generate a fresh global id.
///
/// UUIDv7 embeds a millisecond timestamp in its high bits, so ids sort
/// roughly by creation time.
pub(crate) fn fresh_global_id() -> String {
    Uuid::now_v7().to_string()
}

/// Current unix time in seconds. Clocks before the epoch collapse to 0
/// rather than failing the append.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
