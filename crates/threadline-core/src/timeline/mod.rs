//! Timeline writers, the reader, and the observable [`Timeline`] list.
//!
//! The writers only touch storage inside a caller-supplied transaction.
//! Everything in memory (the sync cursor, the fragment comparer, the entry
//! list below) is updated by the room after that transaction commits.

pub mod gap_writer;
pub mod reader;
pub mod sync_writer;

pub use gap_writer::{GapWriteResult, GapWriter};
pub use reader::TimelineReader;
pub use sync_writer::{SyncWriteResult, SyncWriter};

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::model::{PendingEvent, TimelineEntry};
use crate::ordering::{Direction, FragmentComparer};
use crate::send::{PendingUpdate, SendQueue};
use crate::store::{Storage, StoreName};

const UPDATE_CAPACITY: usize = 256;
const READ_STORES: [StoreName; 2] = [StoreName::TimelineEvents, StoreName::TimelineFragments];

/// Change notification for subscribers of a [`Timeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineUpdate {
    /// The list was replaced wholesale; re-read [`Timeline::entries`].
    Reset,
    /// Remote entries inserted or replaced in place, oldest first.
    Added(Vec<TimelineEntry>),
    Pending(PendingUpdate),
}

#[derive(Debug, Default)]
struct TimelineState {
    /// Sorted by position.
    remote: Vec<TimelineEntry>,
    /// Sorted by queue index.
    pending: Vec<PendingEvent>,
}

impl TimelineState {
    fn apply_pending(&mut self, update: &PendingUpdate) {
        match update {
            PendingUpdate::Added(event)
            | PendingUpdate::Updated(event)
            | PendingUpdate::Failed(event) => {
                if let Some(slot) = self.pending.iter_mut().find(|p| p.txn_id == event.txn_id) {
                    *slot = event.clone();
                } else {
                    let at = self
                        .pending
                        .partition_point(|p| p.queue_index <= event.queue_index);
                    self.pending.insert(at, event.clone());
                }
            }
            PendingUpdate::Removed(event) => {
                self.pending.retain(|p| p.txn_id != event.txn_id);
            }
        }
    }
}

/// Binary search by position. `Ok` is an entry at the same position.
fn search(
    entries: &[TimelineEntry],
    entry: &TimelineEntry,
    comparer: &FragmentComparer,
) -> Result<std::result::Result<usize, usize>> {
    let (mut low, mut high) = (0, entries.len());
    while low < high {
        let mid = low + (high - low) / 2;
        match entries[mid].compare(entry, comparer)? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(low))
}

/// An ordered, observable window over one room's timeline.
///
/// Remote entries come from storage; local echoes follow the room's send
/// queue and always sort after them.
pub struct Timeline {
    room_id: String,
    storage: Storage,
    comparer: Arc<RwLock<FragmentComparer>>,
    send_queue: Arc<SendQueue>,
    reader: TimelineReader,
    page_size: usize,
    state: Mutex<TimelineState>,
    updates: broadcast::Sender<TimelineUpdate>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Timeline {
    /// Create an empty timeline following `send_queue`. Call
    /// [`load`](Self::load) to fill it.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn open(
        room_id: impl Into<String>,
        storage: Storage,
        comparer: Arc<RwLock<FragmentComparer>>,
        send_queue: Arc<SendQueue>,
        page_size: usize,
    ) -> Arc<Self> {
        let room_id = room_id.into();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        // Subscribe before the snapshot; replays are idempotent.
        let pending_rx = send_queue.subscribe();
        let state = TimelineState {
            remote: Vec::new(),
            pending: send_queue.pending_events(),
        };
        let timeline = Arc::new(Self {
            reader: TimelineReader::new(room_id.clone()),
            room_id,
            storage,
            comparer,
            send_queue,
            page_size,
            state: Mutex::new(state),
            updates,
            forwarder: Mutex::new(None),
        });
        let handle = tokio::spawn(forward_pending(Arc::downgrade(&timeline), pending_rx));
        *timeline
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        timeline
    }

    fn state(&self) -> MutexGuard<'_, TimelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, update: TimelineUpdate) {
        let _ = self.updates.send(update);
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.updates.subscribe()
    }

    /// Remote entries followed by local echoes.
    #[must_use]
    pub fn entries(&self) -> Vec<TimelineEntry> {
        let state = self.state();
        state
            .remote
            .iter()
            .cloned()
            .chain(state.pending.iter().cloned().map(TimelineEntry::from))
            .collect()
    }

    /// Replace the remote entries with the newest page of the room.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub async fn load(&self) -> Result<()> {
        let txn = self.storage.read_txn(&READ_STORES).await?;
        let entries = self.reader.read_from_end(self.page_size, &txn)?;
        txn.complete()?;
        tracing::debug!(room_id = %self.room_id, count = entries.len(), "timeline loaded");
        self.state().remote = entries;
        self.emit(TimelineUpdate::Reset);
        Ok(())
    }

    /// Read up to `amount` stored entries above the oldest loaded event.
    /// Returns how many entries were read; boundaries already shown are
    /// refreshed in place.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or if the new entries cannot be ordered.
    pub async fn load_at_top(&self, amount: usize) -> Result<usize> {
        let first_key = self
            .state()
            .remote
            .iter()
            .find_map(|entry| entry.as_event().map(|event| event.key));
        let Some(key) = first_key else {
            return Ok(0);
        };
        let txn = self.storage.read_txn(&READ_STORES).await?;
        let entries = self
            .reader
            .read_from(key, Direction::Backward, amount, &txn)?;
        txn.complete()?;
        let count = entries.len();
        self.merge(entries)?;
        Ok(count)
    }

    /// Entries committed by incremental sync.
    ///
    /// # Errors
    ///
    /// Fails if an entry cannot be ordered against the loaded ones.
    pub fn append_live_entries(&self, entries: Vec<TimelineEntry>) -> Result<()> {
        self.merge(entries)
    }

    /// Entries committed by a gap fill, including refreshed boundaries.
    ///
    /// # Errors
    ///
    /// Fails if an entry cannot be ordered against the loaded ones.
    pub fn add_gap_entries(&self, entries: Vec<TimelineEntry>) -> Result<()> {
        self.merge(entries)
    }

    fn merge(&self, entries: Vec<TimelineEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        {
            let comparer = self.comparer.read().unwrap_or_else(PoisonError::into_inner);
            let mut state = self.state();
            for entry in &entries {
                match search(&state.remote, entry, &comparer)? {
                    Ok(at) => state.remote[at] = entry.clone(),
                    Err(at) => state.remote.insert(at, entry.clone()),
                }
            }
        }
        self.emit(TimelineUpdate::Added(entries));
        Ok(())
    }

    fn apply_pending(&self, update: PendingUpdate) {
        self.state().apply_pending(&update);
        self.emit(TimelineUpdate::Pending(update));
    }

    fn resync_pending(&self) {
        self.state().pending = self.send_queue.pending_events();
        self.emit(TimelineUpdate::Reset);
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        let forwarder = self
            .forwarder
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = forwarder.take() {
            handle.abort();
        }
    }
}

async fn forward_pending(timeline: Weak<Timeline>, mut rx: broadcast::Receiver<PendingUpdate>) {
    loop {
        let received = rx.recv().await;
        let Some(timeline) = timeline.upgrade() else {
            return;
        };
        match received {
            Ok(update) => timeline.apply_pending(update),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(room_id = %timeline.room_id, skipped, "pending updates lagged");
                timeline.resync_pending();
            }
            Err(RecvError::Closed) => return,
        }
    }
}
