use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outgoing event persisted in the `pending_events` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub room_id: String,
    /// Per-room, strictly increasing; assigned when the event is enqueued.
    pub queue_index: u64,
    pub event_type: String,
    pub content: Value,
    pub txn_id: String,
    /// Event id the homeserver assigned once it accepted the send.
    pub remote_id: Option<String>,
    /// Why the last send attempt failed. Held in memory only; a failed event
    /// stays unsent until the caller retries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PendingEvent {
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.remote_id.is_some()
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Generate a client transaction id: `t` followed by 14 hex digits.
#[must_use]
pub fn make_txn_id() -> String {
    // 2^53 keeps the id inside 14 hex digits.
    let n: u64 = rand::thread_rng().gen_range(0..(1_u64 << 53));
    format!("t{n:014x}")
}
