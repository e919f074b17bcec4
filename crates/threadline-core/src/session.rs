//! The logged-in account: its rooms and its sync cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::TimelineConfig;
use crate::error::Result;
use crate::net::{HomeServerApi, SyncResponse};
use crate::room::{Room, RoomSyncResult};
use crate::send::SendScheduler;
use crate::store::session::{SYNC_FILTER_ID, SYNC_TOKEN};
use crate::store::{Storage, StoreName, Txn};

/// Storage effects of one sync response, applied by [`Session::after_sync`].
pub struct SessionSyncResult {
    pub sync_token: String,
    /// Rooms touched by the response. Rooms seen for the first time are not
    /// registered with the session until after commit.
    pub rooms: Vec<(Arc<Room>, RoomSyncResult)>,
}

#[derive(Debug, Default)]
struct Cursor {
    sync_token: Option<String>,
    filter_id: Option<String>,
}

pub struct Session {
    user_id: String,
    storage: Storage,
    api: Arc<dyn HomeServerApi>,
    scheduler: Arc<SendScheduler>,
    timeline_config: TimelineConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    cursor: Mutex<Cursor>,
}

impl Session {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        storage: Storage,
        api: Arc<dyn HomeServerApi>,
        scheduler: Arc<SendScheduler>,
        timeline_config: &TimelineConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
            api,
            scheduler,
            timeline_config: timeline_config.clone(),
            rooms: RwLock::default(),
            cursor: Mutex::default(),
        }
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<SendScheduler> {
        &self.scheduler
    }

    /// `next_batch` of the last committed sync.
    #[must_use]
    pub fn sync_token(&self) -> Option<String> {
        self.cursor().sync_token.clone()
    }

    #[must_use]
    pub fn filter_id(&self) -> Option<String> {
        self.cursor().filter_id.clone()
    }

    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    /// All known rooms, in no particular order.
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn create_room(&self, room_id: &str) -> Arc<Room> {
        Arc::new(Room::new(
            room_id,
            self.storage.clone(),
            Arc::clone(&self.api),
            Arc::clone(&self.scheduler),
            &self.timeline_config,
        ))
    }

    /// Restore the sync cursor and every room with a stored summary.
    ///
    /// # Errors
    ///
    /// Fails on storage errors; the session is left empty then.
    pub async fn load(&self) -> Result<()> {
        let txn = self.storage.read_txn(&StoreName::ALL).await?;
        let session = txn.session()?;
        let sync_token: Option<String> = session.get(SYNC_TOKEN)?;
        let filter_id: Option<String> = session.get(SYNC_FILTER_ID)?;

        let mut rooms = HashMap::new();
        for summary in txn.room_summary()?.get_all()? {
            let room = self.create_room(&summary.room_id);
            room.load(&txn)?;
            rooms.insert(summary.room_id, room);
        }
        txn.complete()?;

        tracing::info!(
            user_id = %self.user_id,
            rooms = rooms.len(),
            has_sync_token = sync_token.is_some(),
            "session loaded"
        );
        *self.cursor() = Cursor {
            sync_token,
            filter_id,
        };
        *self.rooms.write().unwrap_or_else(PoisonError::into_inner) = rooms;
        Ok(())
    }

    /// Accept outgoing requests again and resume every room's outbox.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.scheduler.start();
        for room in self.rooms() {
            room.resume_sending();
        }
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Persist the filter id registered for sync.
    ///
    /// # Errors
    ///
    /// Fails if the id cannot be stored; it is not kept in memory then.
    pub async fn set_filter_id(&self, filter_id: &str) -> Result<()> {
        let txn = self.storage.write_txn(&[StoreName::Session]).await?;
        txn.session()?.set(SYNC_FILTER_ID, filter_id)?;
        txn.complete()?;
        self.cursor().filter_id = Some(filter_id.to_string());
        Ok(())
    }

    /// Write a sync response. `txn` must cover every store.
    ///
    /// During the initial sync, rooms whose timeline is empty are skipped.
    ///
    /// # Errors
    ///
    /// Any error means the caller must abort `txn` and not call
    /// [`after_sync`](Self::after_sync).
    pub fn write_sync(
        &self,
        response: &SyncResponse,
        is_initial_sync: bool,
        txn: &Txn,
    ) -> Result<SessionSyncResult> {
        txn.session()?.set(SYNC_TOKEN, &response.next_batch)?;
        let mut rooms = Vec::new();
        for (room_id, membership, room_response) in response.rooms.iter() {
            if is_initial_sync && room_response.timeline_events().is_empty() {
                tracing::debug!(room_id, "skipping room with empty timeline in initial sync");
                continue;
            }
            let room = self
                .room(room_id)
                .unwrap_or_else(|| self.create_room(room_id));
            let result = room.write_sync(room_response, membership, txn)?;
            rooms.push((room, result));
        }
        Ok(SessionSyncResult {
            sync_token: response.next_batch.clone(),
            rooms,
        })
    }

    /// Apply a committed [`write_sync`](Self::write_sync).
    pub fn after_sync(&self, result: SessionSyncResult) {
        self.cursor().sync_token = Some(result.sync_token);
        for (room, room_result) in result.rooms {
            let is_new = {
                let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
                let is_new = !rooms.contains_key(room.id());
                if is_new {
                    rooms.insert(room.id().to_string(), Arc::clone(&room));
                }
                is_new
            };
            if is_new {
                tracing::info!(room_id = room.id(), "joined new room");
            }
            room.after_sync(room_result);
        }
    }
}
