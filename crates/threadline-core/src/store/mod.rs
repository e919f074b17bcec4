//! Transactional client store over SQLite.
//!
//! [`Storage`] owns one connection. Transactions are admitted one at a time
//! through an async mutex, so two writers never interleave their commits; a
//! [`Txn`] only hands out the stores it was opened with.
//!
//! Runtime defaults follow the projection DB conventions:
//! - `journal_mode = WAL`
//! - `busy_timeout` from [`StorageConfig`]
//! - `foreign_keys = ON` so events cannot point at unknown fragments

pub mod migrations;
pub mod pending_events;
pub mod room_state;
pub mod room_summary;
pub mod schema;
pub mod session;
pub mod timeline_events;
pub mod timeline_fragments;

pub use pending_events::PendingEventStore;
pub use room_state::RoomStateStore;
pub use room_summary::RoomSummaryStore;
pub use session::SessionStore;
pub use timeline_events::TimelineEventStore;
pub use timeline_fragments::TimelineFragmentStore;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// StoreName
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    Session,
    RoomSummary,
    RoomState,
    TimelineEvents,
    TimelineFragments,
    PendingEvents,
}

impl StoreName {
    pub const ALL: [Self; 6] = [
        Self::Session,
        Self::RoomSummary,
        Self::RoomState,
        Self::TimelineEvents,
        Self::TimelineFragments,
        Self::PendingEvents,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::RoomSummary => "room_summary",
            Self::RoomState => "room_state",
            Self::TimelineEvents => "timeline_events",
            Self::TimelineFragments => "timeline_fragments",
            Self::PendingEvents => "pending_events",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Shared handle to the client database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open (or create) the database at `path`, configure it and migrate the
    /// schema to the latest version.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or opening,
    /// configuring or migrating the database fails.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened client store");
        Self::from_connection(conn, config)
    }

    /// # Errors
    ///
    /// Returns an error if configuring or migrating the database fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, &StorageConfig::default())
    }

    fn from_connection(mut conn: Connection, config: &StorageConfig) -> Result<Self> {
        configure_connection(&conn, config)?;
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a read-only transaction over `stores`.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses to begin the transaction.
    pub async fn read_txn(&self, stores: &[StoreName]) -> Result<Txn> {
        self.begin(stores, TxnMode::ReadOnly).await
    }

    /// Open a read-write transaction over `stores`.
    ///
    /// Waits until every earlier transaction has completed or aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite refuses to begin the transaction.
    pub async fn write_txn(&self, stores: &[StoreName]) -> Result<Txn> {
        self.begin(stores, TxnMode::ReadWrite).await
    }

    async fn begin(&self, stores: &[StoreName], mode: TxnMode) -> Result<Txn> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        conn.execute_batch(match mode {
            TxnMode::ReadOnly => "BEGIN DEFERRED",
            TxnMode::ReadWrite => "BEGIN IMMEDIATE",
        })?;
        Ok(Txn {
            conn,
            stores: stores.to_vec(),
            mode,
            finished: false,
        })
    }
}

fn configure_connection(conn: &Connection, config: &StorageConfig) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(config.busy_timeout())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Txn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// An open transaction scoped to a set of stores.
///
/// Finish with [`complete`](Self::complete) or [`abort`](Self::abort).
/// Dropping an unfinished transaction rolls it back.
pub struct Txn {
    conn: OwnedMutexGuard<Connection>,
    stores: Vec<StoreName>,
    mode: TxnMode,
    finished: bool,
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Txn")
            .field("stores", &self.stores)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Txn {
    #[must_use]
    pub const fn mode(&self) -> TxnMode {
        self.mode
    }

    #[must_use]
    pub fn includes(&self, store: StoreName) -> bool {
        self.stores.contains(&store)
    }

    fn scope(&self, store: StoreName) -> Result<Scope<'_>> {
        if !self.includes(store) {
            return Err(Error::StoreNotInScope {
                store: store.as_str(),
            });
        }
        Ok(Scope {
            conn: &*self.conn,
            store,
            writable: self.mode == TxnMode::ReadWrite,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn session(&self) -> Result<SessionStore<'_>> {
        self.scope(StoreName::Session).map(SessionStore::new)
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn room_summary(&self) -> Result<RoomSummaryStore<'_>> {
        self.scope(StoreName::RoomSummary).map(RoomSummaryStore::new)
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn room_state(&self) -> Result<RoomStateStore<'_>> {
        self.scope(StoreName::RoomState).map(RoomStateStore::new)
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn timeline_events(&self) -> Result<TimelineEventStore<'_>> {
        self.scope(StoreName::TimelineEvents)
            .map(TimelineEventStore::new)
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn timeline_fragments(&self) -> Result<TimelineFragmentStore<'_>> {
        self.scope(StoreName::TimelineFragments)
            .map(TimelineFragmentStore::new)
    }

    /// # Errors
    ///
    /// Returns [`Error::StoreNotInScope`] if the store was not requested.
    pub fn pending_events(&self) -> Result<PendingEventStore<'_>> {
        self.scope(StoreName::PendingEvents)
            .map(PendingEventStore::new)
    }

    /// Commit every write made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is rolled back.
    pub fn complete(mut self) -> Result<()> {
        self.finished = true;
        if let Err(error) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(error.into());
        }
        Ok(())
    }

    /// Discard every write made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to roll back.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(%error, "rollback of dropped transaction failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A connection borrowed for one store of one transaction.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'t> {
    conn: &'t Connection,
    store: StoreName,
    writable: bool,
}

impl<'t> Scope<'t> {
    pub(crate) const fn conn(&self) -> &'t Connection {
        self.conn
    }

    /// The connection, if this transaction may write.
    pub(crate) const fn writer(&self) -> Result<&'t Connection> {
        if self.writable {
            Ok(self.conn)
        } else {
            Err(Error::ReadOnlyTransaction {
                store: self.store.as_str(),
            })
        }
    }
}

pub(crate) fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Internal(format!("{column} out of range: {value}")))
}

pub(crate) fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Internal(format!("{column} out of range: {value}")))
}

pub(crate) fn sql_limit(amount: usize) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
