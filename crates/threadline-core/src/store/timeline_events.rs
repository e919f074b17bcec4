use std::collections::HashSet;

use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{Scope, sql_limit, to_u32};
use crate::error::Result;
use crate::model::{RoomEvent, StoredEvent};
use crate::ordering::{EventKey, FragmentId};

const SELECT_COLUMNS: &str = "SELECT room_id, fragment_id, event_index, event_json FROM timeline_events";

/// Raw row, decoded outside the rusqlite row closure so JSON errors keep
/// their own error variant.
struct EventRow {
    room_id: String,
    fragment_id: i64,
    event_index: i64,
    event_json: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            room_id: row.get(0)?,
            fragment_id: row.get(1)?,
            event_index: row.get(2)?,
            event_json: row.get(3)?,
        })
    }

    fn decode(self) -> Result<StoredEvent> {
        let key = EventKey::new(
            FragmentId(to_u32(self.fragment_id, "fragment_id")?),
            to_u32(self.event_index, "event_index")?,
        );
        let event: RoomEvent = serde_json::from_str(&self.event_json)?;
        Ok(StoredEvent::new(self.room_id, key, event))
    }
}

/// Timeline events keyed by `(room, fragment, index)`.
pub struct TimelineEventStore<'t> {
    scope: Scope<'t>,
}

impl<'t> TimelineEventStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// Insert a new event.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate key or a duplicate event id in the room.
    pub fn insert(&self, entry: &StoredEvent) -> Result<()> {
        self.scope.writer()?.execute(
            "INSERT INTO timeline_events (room_id, fragment_id, event_index, event_id, event_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.room_id,
                entry.key.fragment_id.0,
                entry.key.event_index,
                entry.event.event_id,
                serde_json::to_string(&entry.event)?,
            ],
        )?;
        Ok(())
    }

    /// Replace the event stored at `entry.key`.
    ///
    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the update.
    pub fn update(&self, entry: &StoredEvent) -> Result<()> {
        self.scope.writer()?.execute(
            "UPDATE timeline_events SET event_id = ?4, event_json = ?5
             WHERE room_id = ?1 AND fragment_id = ?2 AND event_index = ?3",
            params![
                entry.room_id,
                entry.key.fragment_id.0,
                entry.key.event_index,
                entry.event.event_id,
                serde_json::to_string(&entry.event)?,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get(&self, room_id: &str, key: EventKey) -> Result<Option<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2 AND event_index = ?3"
        );
        self.scope
            .conn()
            .query_row(
                &sql,
                params![room_id, key.fragment_id.0, key.event_index],
                EventRow::from_row,
            )
            .optional()?
            .map(EventRow::decode)
            .transpose()
    }

    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get_by_event_id(&self, room_id: &str, event_id: &str) -> Result<Option<StoredEvent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE room_id = ?1 AND event_id = ?2");
        self.scope
            .conn()
            .query_row(&sql, params![room_id, event_id], EventRow::from_row)
            .optional()?
            .map(EventRow::decode)
            .transpose()
    }

    /// Up to `amount` events of `key`'s fragment immediately before `key`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn events_before(
        &self,
        room_id: &str,
        key: EventKey,
        amount: usize,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2 AND event_index < ?3
             ORDER BY event_index DESC LIMIT ?4"
        );
        let mut events = self.query(
            &sql,
            params![room_id, key.fragment_id.0, key.event_index, sql_limit(amount)],
        )?;
        events.reverse();
        Ok(events)
    }

    /// Up to `amount` events of `key`'s fragment immediately after `key`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn events_after(
        &self,
        room_id: &str,
        key: EventKey,
        amount: usize,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2 AND event_index > ?3
             ORDER BY event_index ASC LIMIT ?4"
        );
        self.query(
            &sql,
            params![room_id, key.fragment_id.0, key.event_index, sql_limit(amount)],
        )
    }

    /// The oldest `amount` events of a fragment, oldest first.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn first_events(
        &self,
        room_id: &str,
        fragment_id: FragmentId,
        amount: usize,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2
             ORDER BY event_index ASC LIMIT ?3"
        );
        self.query(&sql, params![room_id, fragment_id.0, sql_limit(amount)])
    }

    /// The newest `amount` events of a fragment, oldest first.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn last_events(
        &self,
        room_id: &str,
        fragment_id: FragmentId,
        amount: usize,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2
             ORDER BY event_index DESC LIMIT ?3"
        );
        let mut events = self.query(&sql, params![room_id, fragment_id.0, sql_limit(amount)])?;
        events.reverse();
        Ok(events)
    }

    /// Which of `event_ids` are already stored for the room, in one query.
    ///
    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn existing_event_ids(&self, room_id: &str, event_ids: &[&str]) -> Result<HashSet<String>> {
        if event_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "SELECT event_id FROM timeline_events WHERE room_id = ? AND event_id IN ({placeholders})"
        );
        let mut stmt = self.scope.conn().prepare(&sql)?;
        let params = std::iter::once(room_id).chain(event_ids.iter().copied());
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<HashSet<_>>>()?)
    }

    /// The first id of `event_ids`, in list order, that is already stored.
    ///
    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn find_first_occurring_event_id(
        &self,
        room_id: &str,
        event_ids: &[&str],
    ) -> Result<Option<String>> {
        let existing = self.existing_event_ids(room_id, event_ids)?;
        Ok(event_ids
            .iter()
            .find(|id| existing.contains(**id))
            .map(|id| (*id).to_string()))
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredEvent>> {
        let mut stmt = self.scope.conn().prepare(sql)?;
        let rows = stmt
            .query_map(params, EventRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(EventRow::decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{Fragment, RoomEvent, StoredEvent};
    use crate::ordering::{EventKey, FragmentId, MIDDLE_INDEX};
    use crate::store::{Storage, StoreName, Txn};
    use serde_json::json;

    const STORES: [StoreName; 2] = [StoreName::TimelineEvents, StoreName::TimelineFragments];

    async fn seeded() -> (Storage, Txn) {
        let storage = Storage::open_in_memory().expect("open");
        let txn = storage.write_txn(&STORES).await.expect("txn");
        txn.timeline_fragments()
            .expect("fragments")
            .add(&Fragment::new("!r", FragmentId(0)))
            .expect("fragment");
        let events = txn.timeline_events().expect("events");
        for offset in 0..5 {
            let key = EventKey::new(FragmentId(0), MIDDLE_INDEX + offset);
            let event = RoomEvent::new(format!("${offset}"), "m.room.message", json!({"n": offset}));
            events.insert(&StoredEvent::new("!r", key, event)).expect("insert");
        }
        (storage, txn)
    }

    fn ids(events: &[StoredEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event.event_id.as_str()).collect()
    }

    #[tokio::test]
    async fn windows_read_oldest_first() {
        let (_storage, txn) = seeded().await;
        let events = txn.timeline_events().expect("events");
        let middle = EventKey::new(FragmentId(0), MIDDLE_INDEX + 2);

        assert_eq!(ids(&events.events_before("!r", middle, 10).expect("before")), ["$0", "$1"]);
        assert_eq!(ids(&events.events_after("!r", middle, 1).expect("after")), ["$3"]);
        assert_eq!(
            ids(&events.first_events("!r", FragmentId(0), 2).expect("first")),
            ["$0", "$1"]
        );
        assert_eq!(
            ids(&events.last_events("!r", FragmentId(0), 2).expect("last")),
            ["$3", "$4"]
        );
    }

    #[tokio::test]
    async fn lookups_by_key_and_event_id() {
        let (_storage, txn) = seeded().await;
        let events = txn.timeline_events().expect("events");

        let stored = events.get_by_event_id("!r", "$3").expect("get").expect("present");
        assert_eq!(stored.key, EventKey::new(FragmentId(0), MIDDLE_INDEX + 3));
        assert_eq!(stored.event.content, json!({"n": 3}));
        assert_eq!(events.get("!r", stored.key).expect("get"), Some(stored));
        assert_eq!(events.get_by_event_id("!other", "$3").expect("get"), None);
    }

    #[tokio::test]
    async fn first_occurring_id_follows_list_order() {
        let (_storage, txn) = seeded().await;
        let events = txn.timeline_events().expect("events");

        let found = events
            .find_first_occurring_event_id("!r", &["$new", "$4", "$1"])
            .expect("lookup");
        assert_eq!(found.as_deref(), Some("$4"));
        assert_eq!(
            events.find_first_occurring_event_id("!r", &["$x", "$y"]).expect("lookup"),
            None
        );
        assert_eq!(events.find_first_occurring_event_id("!r", &[]).expect("lookup"), None);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let (_storage, txn) = seeded().await;
        let events = txn.timeline_events().expect("events");
        let key = EventKey::new(FragmentId(0), MIDDLE_INDEX + 10);
        let duplicate = StoredEvent::new("!r", key, RoomEvent::new("$2", "m.room.message", json!({})));
        assert!(events.insert(&duplicate).is_err());
    }

    #[tokio::test]
    async fn update_rewrites_the_payload() {
        let (_storage, txn) = seeded().await;
        let events = txn.timeline_events().expect("events");
        let mut stored = events.get_by_event_id("!r", "$1").expect("get").expect("present");
        stored.event.content = json!({"edited": true});
        events.update(&stored).expect("update");
        let reread = events.get("!r", stored.key).expect("get").expect("present");
        assert_eq!(reread.event.content, json!({"edited": true}));
    }
}
