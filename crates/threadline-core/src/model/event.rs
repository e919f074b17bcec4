use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ordering::EventKey;

/// A room event as delivered by `/sync` or `/messages`.
///
/// Only the fields the engine reads are typed; everything else survives a
/// store round trip through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Unsigned>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RoomEvent {
    #[must_use]
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>, content: Value) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            sender: String::new(),
            origin_server_ts: 0,
            content,
            state_key: None,
            unsigned: None,
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    #[must_use]
    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    #[must_use]
    pub fn with_transaction_id(mut self, txn_id: impl Into<String>) -> Self {
        self.unsigned
            .get_or_insert_with(Unsigned::default)
            .transaction_id = Some(txn_id.into());
        self
    }

    /// `unsigned.transaction_id`, present on remote echoes of our own sends.
    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.unsigned
            .as_ref()
            .and_then(|unsigned| unsigned.transaction_id.as_deref())
    }

    #[must_use]
    pub const fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unsigned {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Row of the `timeline_events` store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub room_id: String,
    pub key: EventKey,
    pub event: RoomEvent,
}

impl StoredEvent {
    #[must_use]
    pub fn new(room_id: impl Into<String>, key: EventKey, event: RoomEvent) -> Self {
        Self {
            room_id: room_id.into(),
            key,
            event,
        }
    }
}

/// Membership section a room appeared under in a sync response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
}

impl Membership {
    pub const ALL: [Self; 3] = [Self::Join, Self::Invite, Self::Leave];
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
        })
    }
}
