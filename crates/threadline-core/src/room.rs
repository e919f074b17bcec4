//! One room: summary, timeline writers, fragment comparer and outbox.
//!
//! Writes happen in two phases. `write_sync` runs inside the sync
//! transaction and touches storage only; `after_sync` runs once that
//! transaction committed and brings memory up to date.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::{Value, json};

use crate::config::TimelineConfig;
use crate::error::Result;
use crate::model::{
    Fragment, FragmentBoundaryEntry, Membership, PendingEvent, SummaryData, TimelineEntry,
};
use crate::net::{HomeServerApi, MessagesRequest, RoomResponse};
use crate::ordering::{EventKey, FragmentComparer};
use crate::send::{SendQueue, SendScheduler};
use crate::store::{Storage, StoreName, Txn};
use crate::timeline::{GapWriter, SyncWriter, Timeline};

/// Storage effects of one room's sync section, applied to memory by
/// [`Room::after_sync`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomSyncResult {
    /// New summary, if anything in it changed.
    pub summary_changes: Option<SummaryData>,
    pub new_timeline_entries: Vec<TimelineEntry>,
    pub new_live_key: Option<EventKey>,
    pub removed_pending_events: Vec<PendingEvent>,
    pub changed_fragments: Vec<Fragment>,
}

pub struct Room {
    room_id: String,
    storage: Storage,
    api: Arc<dyn HomeServerApi>,
    config: TimelineConfig,
    summary: RwLock<SummaryData>,
    sync_writer: Mutex<SyncWriter>,
    gap_writer: GapWriter,
    comparer: Arc<RwLock<FragmentComparer>>,
    send_queue: Arc<SendQueue>,
    timeline: Mutex<Option<Arc<Timeline>>>,
}

impl Room {
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        storage: Storage,
        api: Arc<dyn HomeServerApi>,
        scheduler: Arc<SendScheduler>,
        config: &TimelineConfig,
    ) -> Self {
        let room_id = room_id.into();
        Self {
            summary: RwLock::new(SummaryData::new(room_id.clone())),
            sync_writer: Mutex::new(SyncWriter::new(room_id.clone())),
            gap_writer: GapWriter::new(room_id.clone()),
            comparer: Arc::default(),
            send_queue: Arc::new(SendQueue::new(room_id.clone(), storage.clone(), scheduler)),
            timeline: Mutex::new(None),
            config: config.clone(),
            room_id,
            storage,
            api,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn summary(&self) -> SummaryData {
        self.summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.summary
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .display_name()
    }

    #[must_use]
    pub fn send_queue(&self) -> &Arc<SendQueue> {
        &self.send_queue
    }

    /// The open timeline, if any.
    #[must_use]
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.timeline_slot().clone()
    }

    fn timeline_slot(&self) -> MutexGuard<'_, Option<Arc<Timeline>>> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_writer(&self) -> MutexGuard<'_, SyncWriter> {
        self.sync_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore summary, sync cursor, fragment graph and outbox.
    ///
    /// # Errors
    ///
    /// Fails if `txn` lacks the summary, timeline or pending event stores.
    pub fn load(&self, txn: &Txn) -> Result<()> {
        if let Some(summary) = txn.room_summary()?.get(&self.room_id)? {
            *self.summary.write().unwrap_or_else(PoisonError::into_inner) = summary;
        }
        self.sync_writer().load(txn)?;
        let fragments = txn.timeline_fragments()?.all(&self.room_id)?;
        self.comparer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .rebuild(&fragments);
        self.send_queue.load(txn)?;
        tracing::debug!(room_id = %self.room_id, fragments = fragments.len(), "room loaded");
        Ok(())
    }

    /// Write this room's section of a sync response.
    ///
    /// # Errors
    ///
    /// Any error means the caller must abort `txn` and not call
    /// [`after_sync`](Self::after_sync).
    pub fn write_sync(
        &self,
        response: &RoomResponse,
        membership: Membership,
        txn: &Txn,
    ) -> Result<RoomSyncResult> {
        let current = self.summary();
        let summary = current.apply_sync(response, membership);
        let summary_changes = if summary == current {
            None
        } else {
            txn.room_summary()?.set(&summary)?;
            Some(summary)
        };

        let written = self.sync_writer().write_sync(response, txn)?;
        let removed_pending_events = self
            .send_queue
            .remove_remote_echos(response.timeline_events(), txn)?;

        Ok(RoomSyncResult {
            summary_changes,
            new_timeline_entries: written.entries,
            new_live_key: written.new_live_key,
            removed_pending_events,
            changed_fragments: written.changed_fragments,
        })
    }

    /// Apply a committed [`write_sync`](Self::write_sync).
    pub fn after_sync(&self, result: RoomSyncResult) {
        if let Some(summary) = result.summary_changes {
            *self.summary.write().unwrap_or_else(PoisonError::into_inner) = summary;
        }
        self.sync_writer().after_sync(result.new_live_key);
        self.add_fragments(&result.changed_fragments);
        self.send_queue
            .emit_removals(&result.removed_pending_events);
        if let Some(timeline) = self.timeline() {
            if let Err(error) = timeline.append_live_entries(result.new_timeline_entries) {
                tracing::error!(room_id = %self.room_id, %error, "could not add live entries");
            }
        }
    }

    fn add_fragments(&self, fragments: &[Fragment]) {
        if fragments.is_empty() {
            return;
        }
        let mut comparer = self.comparer.write().unwrap_or_else(PoisonError::into_inner);
        for fragment in fragments {
            comparer.add(fragment);
        }
    }

    /// Paginate into the gap at `entry` and store the result.
    ///
    /// Returns the written entries; an edge that is not a gap yields none.
    ///
    /// # Errors
    ///
    /// - network errors of the `/messages` request, before anything is written
    /// - [`crate::Error::StaleGapToken`] if another fill closed this gap first
    /// - storage and fragment link errors; nothing is written then
    pub async fn fill_gap(
        &self,
        entry: &FragmentBoundaryEntry,
        amount: Option<u32>,
    ) -> Result<Vec<TimelineEntry>> {
        let Some(token) = entry.token().filter(|_| entry.is_gap()) else {
            tracing::debug!(
                room_id = %self.room_id,
                fragment_id = %entry.fragment_id(),
                "boundary is not a gap, nothing to fill"
            );
            return Ok(Vec::new());
        };
        let request = MessagesRequest {
            from: token.to_string(),
            dir: entry.direction(),
            limit: amount.unwrap_or(self.config.gap_fill_amount),
            filter: Some(json!({"lazy_load_members": true})),
        };
        let response = self.api.messages(&self.room_id, &request).await?;

        let txn = self
            .storage
            .write_txn(&[StoreName::TimelineEvents, StoreName::TimelineFragments])
            .await?;
        // Dropping `txn` on error rolls the fill back.
        let result = self
            .gap_writer
            .write_fragment_fill(entry, &response, &txn)?;
        txn.complete()?;

        self.add_fragments(&result.changed_fragments);
        if let Some(timeline) = self.timeline() {
            timeline.add_gap_entries(result.entries.clone())?;
        }
        Ok(result.entries)
    }

    /// Queue an event for sending.
    ///
    /// # Errors
    ///
    /// Fails if the event cannot be persisted.
    pub async fn send_event(&self, event_type: &str, content: Value) -> Result<PendingEvent> {
        self.send_queue.enqueue_event(event_type, content).await
    }

    /// Must be called from within a tokio runtime.
    pub fn resume_sending(&self) {
        self.send_queue.resume_sending();
    }

    /// Open (or return the already open) timeline and load its newest page.
    ///
    /// # Errors
    ///
    /// Fails if loading from storage fails; the timeline is not kept then.
    pub async fn open_timeline(&self) -> Result<Arc<Timeline>> {
        if let Some(timeline) = self.timeline() {
            return Ok(timeline);
        }
        let timeline = Timeline::open(
            self.room_id.clone(),
            self.storage.clone(),
            Arc::clone(&self.comparer),
            Arc::clone(&self.send_queue),
            self.config.page_size,
        );
        timeline.load().await?;
        *self.timeline_slot() = Some(Arc::clone(&timeline));
        Ok(timeline)
    }

    pub fn close_timeline(&self) {
        self.timeline_slot().take();
    }
}
