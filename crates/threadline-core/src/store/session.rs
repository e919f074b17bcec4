use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Scope;
use crate::error::Result;

/// Key of the `next_batch` token of the last committed sync.
pub const SYNC_TOKEN: &str = "sync_token";
/// Key of the registered sync filter id.
pub const SYNC_FILTER_ID: &str = "sync_filter_id";

/// Per-account key/value pairs stored as JSON.
pub struct SessionStore<'t> {
    scope: Scope<'t>,
}

impl<'t> SessionStore<'t> {
    pub(crate) const fn new(scope: Scope<'t>) -> Self {
        Self { scope }
    }

    /// # Errors
    ///
    /// Fails on SQLite errors or if the stored value has a different shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let json: Option<String> = self
            .scope
            .conn()
            .query_row(
                "SELECT value_json FROM session WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the write.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.scope.writer()?.execute(
            "INSERT INTO session (key, value_json) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value_json = excluded.value_json",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the store is read-only or SQLite rejects the delete.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.scope
            .writer()?
            .execute("DELETE FROM session WHERE key = ?1", params![key])?;
        Ok(())
    }
}
