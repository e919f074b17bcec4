use rusqlite::{OptionalExtension, params};

use super::Scope;
use crate::error::Result;
use crate::model::SummaryData;

pub struct RoomSummaryStore<'t> {
    scope: Scope<'t>,
}

impl<'t> RoomSummaryStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the write.
    pub fn set(&self, summary: &SummaryData) -> Result<()> {
        self.scope.writer()?.execute(
            "INSERT INTO room_summary (room_id, summary_json) VALUES (?1, ?2)
             ON CONFLICT (room_id) DO UPDATE SET summary_json = excluded.summary_json",
            params![summary.room_id, serde_json::to_string(summary)?],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get(&self, room_id: &str) -> Result<Option<SummaryData>> {
        let json: Option<String> = self
            .scope
            .conn()
            .query_row(
                "SELECT summary_json FROM room_summary WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    /// Every stored summary, ordered by room id.
    ///
    /// # Errors
    ///
    /// Fails on SQLite or JSON decoding errors.
    pub fn get_all(&self) -> Result<Vec<SummaryData>> {
        let mut stmt = self
            .scope
            .conn()
            .prepare("SELECT summary_json FROM room_summary ORDER BY room_id")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }
}
