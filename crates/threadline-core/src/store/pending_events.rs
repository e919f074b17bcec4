use rusqlite::{OptionalExtension, Row, params};

use super::{Scope, to_u64};
use crate::error::Result;
use crate::model::PendingEvent;

const SELECT_COLUMNS: &str =
    "SELECT room_id, queue_index, event_type, content_json, txn_id, remote_id FROM pending_events";

struct PendingRow {
    room_id: String,
    queue_index: i64,
    event_type: String,
    content_json: String,
    txn_id: String,
    remote_id: Option<String>,
}

impl PendingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            room_id: row.get(0)?,
            queue_index: row.get(1)?,
            event_type: row.get(2)?,
            content_json: row.get(3)?,
            txn_id: row.get(4)?,
            remote_id: row.get(5)?,
        })
    }

    fn decode(self) -> Result<PendingEvent> {
        Ok(PendingEvent {
            room_id: self.room_id,
            queue_index: to_u64(self.queue_index, "queue_index")?,
            event_type: self.event_type,
            content: serde_json::from_str(&self.content_json)?,
            txn_id: self.txn_id,
            remote_id: self.remote_id,
            error: None,
        })
    }
}

fn queue_index_param(queue_index: u64) -> i64 {
    i64::try_from(queue_index).unwrap_or(i64::MAX)
}

/// The outbox.
pub struct PendingEventStore<'t> {
    scope: Scope<'t>,
}

impl<'t> PendingEventStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// # Errors
    ///
    /// Fails if the `(room, queue_index)` slot is taken.
    pub fn add(&self, pending: &PendingEvent) -> Result<()> {
        self.scope.writer()?.execute(
            "INSERT INTO pending_events (room_id, queue_index, event_type, content_json, txn_id, remote_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pending.room_id,
                queue_index_param(pending.queue_index),
                pending.event_type,
                serde_json::to_string(&pending.content)?,
                pending.txn_id,
                pending.remote_id,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the update.
    pub fn update(&self, pending: &PendingEvent) -> Result<()> {
        self.scope.writer()?.execute(
            "UPDATE pending_events
             SET event_type = ?3, content_json = ?4, txn_id = ?5, remote_id = ?6
             WHERE room_id = ?1 AND queue_index = ?2",
            params![
                pending.room_id,
                queue_index_param(pending.queue_index),
                pending.event_type,
                serde_json::to_string(&pending.content)?,
                pending.txn_id,
                pending.remote_id,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the delete.
    pub fn remove(&self, room_id: &str, queue_index: u64) -> Result<()> {
        self.scope.writer()?.execute(
            "DELETE FROM pending_events WHERE room_id = ?1 AND queue_index = ?2",
            params![room_id, queue_index_param(queue_index)],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn exists(&self, room_id: &str, queue_index: u64) -> Result<bool> {
        Ok(self.scope.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_events WHERE room_id = ?1 AND queue_index = ?2)",
            params![room_id, queue_index_param(queue_index)],
            |row| row.get(0),
        )?)
    }

    /// Highest queue index in use for the room.
    ///
    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn get_max_queue_index(&self, room_id: &str) -> Result<Option<u64>> {
        let max: Option<i64> = self
            .scope
            .conn()
            .query_row(
                "SELECT MAX(queue_index) FROM pending_events WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        max.map(|value| to_u64(value, "queue_index")).transpose()
    }

    /// Every pending event across rooms, by room then queue index.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get_all(&self) -> Result<Vec<PendingEvent>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY room_id, queue_index");
        self.query(&sql, [])
    }

    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get_all_for_room(&self, room_id: &str) -> Result<Vec<PendingEvent>> {
        let sql = format!("{SELECT_COLUMNS} WHERE room_id = ?1 ORDER BY queue_index");
        self.query(&sql, params![room_id])
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PendingEvent>> {
        let mut stmt = self.scope.conn().prepare(sql)?;
        let rows = stmt
            .query_map(params, PendingRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(PendingRow::decode).collect()
    }
}
