use rusqlite::{OptionalExtension, params};

use super::Scope;
use crate::error::Result;
use crate::model::RoomEvent;

/// Current room state, last write wins per `(type, state_key)`.
pub struct RoomStateStore<'t> {
    scope: Scope<'t>,
}

impl<'t> RoomStateStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// Store a state event. Events without a `state_key` are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the write.
    pub fn set_state_event(&self, room_id: &str, event: &RoomEvent) -> Result<()> {
        let Some(state_key) = event.state_key.as_deref() else {
            return Ok(());
        };
        self.scope.writer()?.execute(
            "INSERT INTO room_state (room_id, event_type, state_key, event_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (room_id, event_type, state_key) DO UPDATE SET event_json = excluded.event_json",
            params![
                room_id,
                event.event_type,
                state_key,
                serde_json::to_string(event)?
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<RoomEvent>> {
        let json: Option<String> = self
            .scope
            .conn()
            .query_row(
                "SELECT event_json FROM room_state
                 WHERE room_id = ?1 AND event_type = ?2 AND state_key = ?3",
                params![room_id, event_type, state_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|json| serde_json::from_str(&json)).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::RoomEvent;
    use crate::store::{Storage, StoreName};
    use serde_json::json;

    #[tokio::test]
    async fn last_write_wins_per_type_and_state_key() {
        let storage = Storage::open_in_memory().expect("open");
        let txn = storage
            .write_txn(&[StoreName::RoomState])
            .await
            .expect("txn");
        let store = txn.room_state().expect("store");

        let old = RoomEvent::new("$1", "m.room.name", json!({"name": "Old"})).with_state_key("");
        let new = RoomEvent::new("$2", "m.room.name", json!({"name": "New"})).with_state_key("");
        store.set_state_event("!r", &old).expect("set");
        store.set_state_event("!r", &new).expect("set");
        store
            .set_state_event("!r", &RoomEvent::new("$3", "m.room.message", json!({})))
            .expect("non-state ignored");

        let current = store.get("!r", "m.room.name", "").expect("get").expect("present");
        assert_eq!(current.event_id, "$2");
        assert_eq!(store.get("!r", "m.room.message", "").expect("get"), None);
    }
}
