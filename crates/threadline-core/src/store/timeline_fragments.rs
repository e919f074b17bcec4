use rusqlite::{OptionalExtension, Row, params};

use super::{Scope, to_u32};
use crate::error::Result;
use crate::model::Fragment;
use crate::ordering::FragmentId;

const SELECT_COLUMNS: &str = "SELECT room_id, fragment_id, previous_id, next_id, previous_token, \
     next_token, start_reached, end_reached FROM timeline_fragments";

struct FragmentRow {
    room_id: String,
    fragment_id: i64,
    previous_id: Option<i64>,
    next_id: Option<i64>,
    previous_token: Option<String>,
    next_token: Option<String>,
    start_reached: bool,
    end_reached: bool,
}

impl FragmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            room_id: row.get(0)?,
            fragment_id: row.get(1)?,
            previous_id: row.get(2)?,
            next_id: row.get(3)?,
            previous_token: row.get(4)?,
            next_token: row.get(5)?,
            start_reached: row.get(6)?,
            end_reached: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Fragment> {
        let link = |value: Option<i64>, column: &str| {
            value
                .map(|id| to_u32(id, column).map(FragmentId))
                .transpose()
        };
        Ok(Fragment {
            room_id: self.room_id,
            id: FragmentId(to_u32(self.fragment_id, "fragment_id")?),
            previous_id: link(self.previous_id, "previous_id")?,
            next_id: link(self.next_id, "next_id")?,
            previous_token: self.previous_token,
            next_token: self.next_token,
            start_reached: self.start_reached,
            end_reached: self.end_reached,
        })
    }
}

/// The fragment link graph.
pub struct TimelineFragmentStore<'t> {
    scope: Scope<'t>,
}

impl<'t> TimelineFragmentStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// # Errors
    ///
    /// Fails if a fragment with the same id already exists in the room.
    pub fn add(&self, fragment: &Fragment) -> Result<()> {
        self.scope.writer()?.execute(
            "INSERT INTO timeline_fragments (room_id, fragment_id, previous_id, next_id,
                 previous_token, next_token, start_reached, end_reached)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fragment.room_id,
                fragment.id.0,
                fragment.previous_id.map(|id| id.0),
                fragment.next_id.map(|id| id.0),
                fragment.previous_token,
                fragment.next_token,
                fragment.start_reached,
                fragment.end_reached,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the update.
    pub fn update(&self, fragment: &Fragment) -> Result<()> {
        self.scope.writer()?.execute(
            "UPDATE timeline_fragments
             SET previous_id = ?3, next_id = ?4, previous_token = ?5, next_token = ?6,
                 start_reached = ?7, end_reached = ?8
             WHERE room_id = ?1 AND fragment_id = ?2",
            params![
                fragment.room_id,
                fragment.id.0,
                fragment.previous_id.map(|id| id.0),
                fragment.next_id.map(|id| id.0),
                fragment.previous_token,
                fragment.next_token,
                fragment.start_reached,
                fragment.end_reached,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn get(&self, room_id: &str, id: FragmentId) -> Result<Option<Fragment>> {
        let sql = format!("{SELECT_COLUMNS} WHERE room_id = ?1 AND fragment_id = ?2");
        self.scope
            .conn()
            .query_row(&sql, params![room_id, id.0], FragmentRow::from_row)
            .optional()?
            .map(FragmentRow::decode)
            .transpose()
    }

    /// The fragment with neither a forward link nor a forward token.
    ///
    /// If storage somehow holds several, the highest id wins and a warning is
    /// logged.
    ///
    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn live_fragment(&self, room_id: &str) -> Result<Option<Fragment>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE room_id = ?1 AND next_id IS NULL AND next_token IS NULL
             ORDER BY fragment_id DESC"
        );
        let mut live = self.query(&sql, room_id)?;
        if live.len() > 1 {
            tracing::warn!(
                room_id,
                count = live.len(),
                "more than one live fragment in store"
            );
        }
        Ok(if live.is_empty() {
            None
        } else {
            Some(live.swap_remove(0))
        })
    }

    /// Every fragment of a room, ascending by id.
    ///
    /// # Errors
    ///
    /// Fails on SQLite errors.
    pub fn all(&self, room_id: &str) -> Result<Vec<Fragment>> {
        let sql = format!("{SELECT_COLUMNS} WHERE room_id = ?1 ORDER BY fragment_id ASC");
        self.query(&sql, room_id)
    }

    fn query(&self, sql: &str, room_id: &str) -> Result<Vec<Fragment>> {
        let mut stmt = self.scope.conn().prepare(sql)?;
        let rows = stmt
            .query_map(params![room_id], FragmentRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(FragmentRow::decode).collect()
    }
}
