//! Room summary projection.
//!
//! [`SummaryData`] is a plain value. [`SummaryData::apply_sync`] folds one
//! room section of a sync response into a *new* value, one field at a time;
//! the caller persists and publishes it only if it differs from the old one.

use serde::{Deserialize, Serialize};

use crate::model::{Membership, RoomEvent};
use crate::net::{RoomResponse, RoomSummaryResponse};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryData {
    pub room_id: String,
    pub name: Option<String>,
    pub canonical_alias: Option<String>,
    #[serde(default)]
    pub alt_aliases: Vec<String>,
    pub last_message_body: Option<String>,
    pub last_message_timestamp: Option<u64>,
    #[serde(default)]
    pub is_encrypted: bool,
    pub membership: Option<Membership>,
    #[serde(default)]
    pub invite_count: u64,
    #[serde(default)]
    pub join_count: u64,
    #[serde(default)]
    pub heroes: Vec<String>,
    pub last_pagination_token: Option<String>,
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

impl SummaryData {
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    /// Project one sync room section onto this summary.
    ///
    /// State events are applied before timeline events.
    #[must_use]
    pub fn apply_sync(&self, response: &RoomResponse, membership: Membership) -> Self {
        let mut data = self.clone();

        if let Some(summary) = &response.summary {
            data = data.with_summary(summary);
        }
        if data.membership != Some(membership) {
            data = Self {
                membership: Some(membership),
                ..data
            };
        }
        if let Some(state) = &response.state {
            data = state.events.iter().fold(data, Self::with_event);
        }
        if let Some(timeline) = &response.timeline {
            if let Some(token) = &timeline.prev_batch {
                data = Self {
                    last_pagination_token: Some(token.clone()),
                    ..data
                };
            }
            data = timeline.events.iter().fold(data, Self::with_event);
        }
        if let Some(unread) = &response.unread_notifications {
            data = Self {
                highlight_count: unread.highlight_count.unwrap_or(data.highlight_count),
                notification_count: unread
                    .notification_count
                    .unwrap_or(data.notification_count),
                ..data
            };
        }
        data
    }

    fn with_summary(self, summary: &RoomSummaryResponse) -> Self {
        Self {
            heroes: summary.heroes.clone().unwrap_or(self.heroes),
            join_count: summary.joined_member_count.unwrap_or(self.join_count),
            invite_count: summary.invited_member_count.unwrap_or(self.invite_count),
            ..self
        }
    }

    fn with_event(self, event: &RoomEvent) -> Self {
        let content = &event.content;
        match event.event_type.as_str() {
            "m.room.encryption" => Self {
                is_encrypted: true,
                ..self
            },
            "m.room.name" => Self {
                name: content
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
                ..self
            },
            "m.room.canonical_alias" => Self {
                canonical_alias: content
                    .get("alias")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                alt_aliases: content
                    .get("alt_aliases")
                    .and_then(|v| v.as_array())
                    .map(|aliases| {
                        aliases
                            .iter()
                            .filter_map(|a| a.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                ..self
            },
            "m.room.message"
                if content.get("msgtype").and_then(|v| v.as_str()) == Some("m.text") =>
            {
                Self {
                    last_message_body: content
                        .get("body")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    last_message_timestamp: Some(event.origin_server_ts),
                    ..self
                }
            }
            _ => self,
        }
    }

    /// Name shown for the room: explicit name, alias, heroes, then id.
    #[must_use]
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(alias) = &self.canonical_alias {
            return alias.clone();
        }
        if !self.heroes.is_empty() {
            return self.heroes.join(", ");
        }
        self.room_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{StateResponse, TimelineResponse, UnreadNotifications};
    use serde_json::json;

    fn response_with_timeline(events: Vec<RoomEvent>) -> RoomResponse {
        RoomResponse {
            timeline: Some(TimelineResponse {
                events,
                limited: false,
                prev_batch: Some("p1".to_string()),
            }),
            ..RoomResponse::default()
        }
    }

    #[test]
    fn name_alias_heroes_fallback_chain() {
        let mut data = SummaryData::new("!room:hs");
        assert_eq!(data.display_name(), "!room:hs");
        data.heroes = vec!["@a:hs".into(), "@b:hs".into()];
        assert_eq!(data.display_name(), "@a:hs, @b:hs");
        data.canonical_alias = Some("#room:hs".into());
        assert_eq!(data.display_name(), "#room:hs");
        data.name = Some("Room".into());
        assert_eq!(data.display_name(), "Room");
    }

    #[test]
    fn unchanged_response_yields_equal_value() {
        let data = SummaryData::new("!room:hs").apply_sync(&RoomResponse::default(), Membership::Join);
        let again = data.apply_sync(&RoomResponse::default(), Membership::Join);
        assert_eq!(data, again);
    }

    #[test]
    fn apply_sync_leaves_the_original_untouched() {
        let original = SummaryData::new("!room:hs");
        let response = response_with_timeline(vec![
            RoomEvent::new("$1", "m.room.name", json!({"name": "Lobby"})).with_state_key(""),
            RoomEvent::new("$2", "m.room.message", json!({"msgtype": "m.text", "body": "hi"})),
        ]);

        let updated = original.apply_sync(&response, Membership::Join);
        assert_eq!(original.name, None);
        assert_eq!(updated.name.as_deref(), Some("Lobby"));
        assert_eq!(updated.last_message_body.as_deref(), Some("hi"));
        assert_eq!(updated.last_pagination_token.as_deref(), Some("p1"));
        assert_eq!(updated.membership, Some(Membership::Join));
    }

    #[test]
    fn state_applies_before_timeline() {
        let response = RoomResponse {
            state: Some(StateResponse {
                events: vec![RoomEvent::new("$s", "m.room.name", json!({"name": "Old"}))],
            }),
            ..response_with_timeline(vec![RoomEvent::new(
                "$t",
                "m.room.name",
                json!({"name": "New"}),
            )])
        };
        let data = SummaryData::new("!r").apply_sync(&response, Membership::Join);
        assert_eq!(data.name.as_deref(), Some("New"));
    }

    #[test]
    fn summary_counts_encryption_and_notifications() {
        let response = RoomResponse {
            summary: Some(RoomSummaryResponse {
                heroes: Some(vec!["@bob:hs".into()]),
                joined_member_count: Some(3),
                invited_member_count: Some(1),
            }),
            unread_notifications: Some(UnreadNotifications {
                highlight_count: Some(2),
                notification_count: Some(5),
            }),
            ..response_with_timeline(vec![
                RoomEvent::new("$e", "m.room.encryption", json!({})),
                RoomEvent::new("$n", "m.room.message", json!({"msgtype": "m.notice", "body": "x"})),
            ])
        };
        let data = SummaryData::new("!r").apply_sync(&response, Membership::Invite);
        assert_eq!(data.heroes, vec!["@bob:hs".to_string()]);
        assert_eq!((data.join_count, data.invite_count), (3, 1));
        assert!(data.is_encrypted);
        assert_eq!(data.last_message_body, None, "notices do not count");
        assert_eq!((data.highlight_count, data.notification_count), (2, 5));
        assert_eq!(data.membership, Some(Membership::Invite));
    }
}
