//! Request and response bodies of the client-server endpoints the engine uses.
//!
//! Only fields the engine reads are typed. Unknown fields are ignored on
//! deserialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Membership, RoomEvent};
use crate::ordering::Direction;

// ---------------------------------------------------------------------------
// /sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: RoomsResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomsResponse {
    #[serde(default)]
    pub join: BTreeMap<String, RoomResponse>,
    #[serde(default)]
    pub invite: BTreeMap<String, RoomResponse>,
    #[serde(default)]
    pub leave: BTreeMap<String, RoomResponse>,
}

impl RoomsResponse {
    /// Every room section with the membership it was listed under.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Membership, &RoomResponse)> {
        section(&self.join, Membership::Join)
            .chain(section(&self.invite, Membership::Invite))
            .chain(section(&self.leave, Membership::Leave))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.invite.is_empty() && self.leave.is_empty()
    }
}

fn section(
    rooms: &BTreeMap<String, RoomResponse>,
    membership: Membership,
) -> impl Iterator<Item = (&str, Membership, &RoomResponse)> {
    rooms
        .iter()
        .map(move |(room_id, room)| (room_id.as_str(), membership, room))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RoomSummaryResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotifications>,
}

impl RoomResponse {
    /// Timeline events of this section, empty when absent.
    #[must_use]
    pub fn timeline_events(&self) -> &[RoomEvent] {
        match &self.timeline {
            Some(timeline) => &timeline.events,
            None => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummaryResponse {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<String>>,
    #[serde(
        rename = "m.joined_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub joined_member_count: Option<u64>,
    #[serde(
        rename = "m.invited_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub invited_member_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineResponse {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_count: Option<u64>,
}

// ---------------------------------------------------------------------------
// /messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub from: String,
    pub dir: Direction,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

/// One page of `/messages`.
///
/// `chunk` is in pagination order: newest first when paginating backward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<RoomEvent>,
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

// ---------------------------------------------------------------------------
// send / versions / filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub event_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersions {
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub unstable_features: BTreeMap<String, bool>,
}

/// Body of the sync filter the engine registers on first start.
#[must_use]
pub fn default_sync_filter(timeline_limit: u32) -> Value {
    serde_json::json!({
        "room": {
            "state": { "lazy_load_members": true },
            "timeline": { "limit": timeline_limit }
        }
    })
}
