//! Appends events from incremental sync to a room's live fragment.
//!
//! The writer keeps one in-memory cursor, the key of the newest live event.
//! [`SyncWriter::write_sync`] never moves it; the caller hands the returned
//! key to [`SyncWriter::after_sync`] once the transaction has committed.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::{
    EventEntry, Fragment, FragmentBoundaryEntry, RoomEvent, StoredEvent, TimelineEntry,
};
use crate::net::RoomResponse;
use crate::ordering::{EventKey, FragmentId};
use crate::store::Txn;

/// What one room's sync section changed in storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncWriteResult {
    /// Boundaries and events in timeline order.
    pub entries: Vec<TimelineEntry>,
    /// Cursor to install with [`SyncWriter::after_sync`]. `None` when the
    /// room has no live fragment yet.
    pub new_live_key: Option<EventKey>,
    /// Fragments created or relinked; feed them to the comparer after commit.
    pub changed_fragments: Vec<Fragment>,
}

#[derive(Debug, Clone)]
pub struct SyncWriter {
    room_id: String,
    last_live_key: Option<EventKey>,
}

impl SyncWriter {
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            last_live_key: None,
        }
    }

    #[must_use]
    pub const fn last_live_key(&self) -> Option<EventKey> {
        self.last_live_key
    }

    /// Restore the cursor from storage.
    ///
    /// # Errors
    ///
    /// Fails if the transaction lacks the fragment or event stores.
    pub fn load(&mut self, txn: &Txn) -> Result<()> {
        self.last_live_key = self.read_live_key(txn)?;
        if let Some(key) = self.last_live_key {
            tracing::debug!(room_id = %self.room_id, %key, "loaded live key");
        }
        Ok(())
    }

    fn read_live_key(&self, txn: &Txn) -> Result<Option<EventKey>> {
        let Some(live) = txn.timeline_fragments()?.live_fragment(&self.room_id)? else {
            return Ok(None);
        };
        let last = txn
            .timeline_events()?
            .last_events(&self.room_id, live.id, 1)?;
        Ok(Some(last.first().map_or_else(
            || EventKey::default_fragment_key(live.id),
            |event| event.key,
        )))
    }

    /// Write one room section of a sync response.
    ///
    /// # Errors
    ///
    /// Storage failures and a missing live fragment abort the write; the
    /// caller must abort the transaction and skip [`after_sync`](Self::after_sync).
    pub fn write_sync(&self, response: &RoomResponse, txn: &Txn) -> Result<SyncWriteResult> {
        let mut result = SyncWriteResult::default();
        let mut current_key = self.last_live_key;

        if let Some(timeline) = &response.timeline {
            let prev_batch = timeline.prev_batch.clone();
            let key = match current_key {
                None => {
                    let (live, key) = self.ensure_live_fragment(prev_batch, txn)?;
                    result
                        .entries
                        .push(FragmentBoundaryEntry::start(live.clone()).into());
                    result.changed_fragments.push(live);
                    key
                }
                Some(key) if timeline.limited => {
                    let (old, new) = self.replace_live_fragment(key.fragment_id, prev_batch, txn)?;
                    result
                        .entries
                        .push(FragmentBoundaryEntry::end(old.clone()).into());
                    result
                        .entries
                        .push(FragmentBoundaryEntry::start(new.clone()).into());
                    result.changed_fragments.extend([old, new]);
                    key.next_fragment_key()?
                }
                Some(key) => key,
            };
            current_key = Some(self.append_events(&timeline.events, key, txn, &mut result.entries)?);
        }

        self.persist_state(response, txn)?;
        result.new_live_key = current_key;
        Ok(result)
    }

    /// Install the cursor of a committed write.
    pub fn after_sync(&mut self, new_live_key: Option<EventKey>) {
        if new_live_key.is_some() {
            self.last_live_key = new_live_key;
        }
    }

    fn ensure_live_fragment(
        &self,
        previous_token: Option<String>,
        txn: &Txn,
    ) -> Result<(Fragment, EventKey)> {
        let fragments = txn.timeline_fragments()?;
        if let Some(existing) = fragments.live_fragment(&self.room_id)? {
            // Storage is ahead of the cursor, e.g. the room was never loaded.
            let last = txn
                .timeline_events()?
                .last_events(&self.room_id, existing.id, 1)?;
            let key = last.first().map_or_else(
                || EventKey::default_fragment_key(existing.id),
                |event| event.key,
            );
            return Ok((existing, key));
        }

        let live = Fragment::new(&self.room_id, FragmentId::FIRST).with_previous_token(previous_token);
        fragments.add(&live)?;
        tracing::info!(room_id = %self.room_id, fragment_id = %live.id, "created live fragment");
        Ok((live, EventKey::default_live_key()))
    }

    fn replace_live_fragment(
        &self,
        old_id: FragmentId,
        previous_token: Option<String>,
        txn: &Txn,
    ) -> Result<(Fragment, Fragment)> {
        let fragments = txn.timeline_fragments()?;
        let mut old = fragments
            .get(&self.room_id, old_id)?
            .ok_or_else(|| Error::UnknownFragment {
                room_id: self.room_id.clone(),
                fragment_id: old_id,
            })?;
        let new_id = old_id.next()?;
        old.next_id = Some(new_id);
        fragments.update(&old)?;

        let new = Fragment::new(&self.room_id, new_id)
            .with_previous(old_id)
            .with_previous_token(previous_token);
        fragments.add(&new)?;
        tracing::info!(
            room_id = %self.room_id,
            old_fragment = %old_id,
            new_fragment = %new_id,
            "limited sync, replaced live fragment"
        );
        Ok((old, new))
    }

    fn append_events(
        &self,
        events: &[RoomEvent],
        mut key: EventKey,
        txn: &Txn,
        entries: &mut Vec<TimelineEntry>,
    ) -> Result<EventKey> {
        let mut seen = HashSet::new();
        let unique: Vec<&RoomEvent> = events
            .iter()
            .filter(|event| seen.insert(event.event_id.as_str()))
            .collect();
        if unique.len() < events.len() {
            tracing::warn!(
                room_id = %self.room_id,
                dropped = events.len() - unique.len(),
                "sync batch repeated event ids"
            );
        }

        let store = txn.timeline_events()?;
        let ids: Vec<&str> = unique.iter().map(|event| event.event_id.as_str()).collect();
        let stored = store.existing_event_ids(&self.room_id, &ids)?;

        for event in unique {
            if stored.contains(&event.event_id) {
                tracing::debug!(
                    room_id = %self.room_id,
                    event_id = %event.event_id,
                    "skipping already stored event"
                );
                continue;
            }
            key = key.next_key()?;
            let entry = StoredEvent::new(&self.room_id, key, event.clone());
            store.insert(&entry)?;
            entries.push(EventEntry::from(entry).into());
        }
        Ok(key)
    }

    fn persist_state(&self, response: &RoomResponse, txn: &Txn) -> Result<()> {
        let state_events = response.state.iter().flat_map(|state| state.events.iter());
        let timeline_state = response
            .timeline_events()
            .iter()
            .filter(|event| event.is_state());
        let mut state_events = state_events.chain(timeline_state).peekable();
        if state_events.peek().is_none() {
            return Ok(());
        }
        let store = txn.room_state()?;
        for event in state_events {
            store.set_state_event(&self.room_id, event)?;
        }
        Ok(())
    }
}
