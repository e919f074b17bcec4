//! Fills a gap at one edge of a fragment with a page of `/messages`.
//!
//! Events are written outward from the fragment's edge event. When the page
//! overlaps an event we already store, the overlap tells us which fragment
//! lies beyond the gap; both fragments are linked and their facing tokens
//! cleared, closing the gap.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::model::{
    EventEntry, Fragment, FragmentBoundaryEntry, RoomEvent, StoredEvent, TimelineEntry,
    directional_append,
};
use crate::net::MessagesResponse;
use crate::ordering::{Direction, EventKey, FragmentId};
use crate::store::Txn;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GapWriteResult {
    /// New events plus refreshed boundaries, oldest first.
    pub entries: Vec<TimelineEntry>,
    /// Fragments whose links changed; feed them to the comparer after commit.
    pub changed_fragments: Vec<Fragment>,
}

struct Overlap<'a> {
    non_overlapping: Vec<&'a RoomEvent>,
    neighbour: Option<FragmentBoundaryEntry>,
}

#[derive(Debug, Clone)]
pub struct GapWriter {
    room_id: String,
}

impl GapWriter {
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }

    /// Write one page of pagination results behind `fragment_entry`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownFragment`] if the fragment is not stored
    /// - [`Error::StaleGapToken`] if `response.start` is not the edge's
    ///   current token, i.e. another fill got there first
    /// - [`Error::FragmentLinkConflict`] if the overlap contradicts an
    ///   existing link
    pub fn write_fragment_fill(
        &self,
        fragment_entry: &FragmentBoundaryEntry,
        response: &MessagesResponse,
        txn: &Txn,
    ) -> Result<GapWriteResult> {
        let fragment_id = fragment_entry.fragment_id();
        let fragment = txn
            .timeline_fragments()?
            .get(&self.room_id, fragment_id)?
            .ok_or_else(|| self.unknown(fragment_id))?;
        let mut entry = fragment_entry.with_updated_fragment(fragment);
        let direction = entry.direction();

        if entry.token() != Some(response.start.as_str()) {
            return Err(Error::StaleGapToken {
                expected: entry.token().map(str::to_string),
                actual: response.start.clone(),
            });
        }

        if response.chunk.is_empty() {
            tracing::info!(
                room_id = %self.room_id,
                %fragment_id,
                %direction,
                "pagination returned nothing, edge of history reached"
            );
            entry.set_edge_reached(true);
            txn.timeline_fragments()?.update(&entry.fragment)?;
            return Ok(GapWriteResult {
                changed_fragments: vec![entry.fragment.clone()],
                entries: vec![entry.into()],
            });
        }

        let edge_key = self.find_fragment_edge_event_key(&entry, txn)?;
        let overlap = self.find_overlapping_events(&entry, &response.chunk, txn)?;
        let events = self.unique_events(&overlap.non_overlapping);
        let mut entries = self.store_events(&events, edge_key, direction, txn)?;
        tracing::debug!(
            room_id = %self.room_id,
            %fragment_id,
            %direction,
            received = response.chunk.len(),
            stored = events.len(),
            "filled gap"
        );

        let changed_fragments = self.update_fragments(
            entry,
            overlap.neighbour,
            response.end.clone(),
            &mut entries,
            txn,
        )?;
        Ok(GapWriteResult {
            entries,
            changed_fragments,
        })
    }

    fn unknown(&self, fragment_id: FragmentId) -> Error {
        Error::UnknownFragment {
            room_id: self.room_id.clone(),
            fragment_id,
        }
    }

    /// The stored event at the edge of `fragment_id` facing `direction`.
    fn find_fragment_edge_event(
        &self,
        fragment_id: FragmentId,
        direction: Direction,
        txn: &Txn,
    ) -> Result<Option<StoredEvent>> {
        let store = txn.timeline_events()?;
        let mut events = match direction {
            Direction::Backward => store.first_events(&self.room_id, fragment_id, 1)?,
            Direction::Forward => store.last_events(&self.room_id, fragment_id, 1)?,
        };
        Ok(events.pop())
    }

    fn find_fragment_edge_event_key(
        &self,
        entry: &FragmentBoundaryEntry,
        txn: &Txn,
    ) -> Result<EventKey> {
        Ok(self
            .find_fragment_edge_event(entry.fragment_id(), entry.direction(), txn)?
            .map_or_else(
                || EventKey::default_fragment_key(entry.fragment_id()),
                |event| event.key,
            ))
    }

    /// Id of the event at the facing edge of the already linked neighbour.
    fn find_expected_overlapping_event_id(
        &self,
        entry: &FragmentBoundaryEntry,
        txn: &Txn,
    ) -> Result<Option<String>> {
        let Some(linked_id) = entry.linked_fragment_id() else {
            return Ok(None);
        };
        Ok(self
            .find_fragment_edge_event(linked_id, entry.direction().reverse(), txn)?
            .map(|event| event.event.event_id))
    }

    fn find_overlapping_events<'a>(
        &self,
        entry: &FragmentBoundaryEntry,
        chunk: &'a [RoomEvent],
        txn: &Txn,
    ) -> Result<Overlap<'a>> {
        let expected = self.find_expected_overlapping_event_id(entry, txn)?;
        let store = txn.timeline_events()?;
        let mut non_overlapping = Vec::with_capacity(chunk.len());
        let mut neighbour = None;
        let mut remaining = chunk;

        while !remaining.is_empty() {
            let ids: Vec<&str> = remaining.iter().map(|e| e.event_id.as_str()).collect();
            let Some(duplicate_id) = store.find_first_occurring_event_id(&self.room_id, &ids)?
            else {
                non_overlapping.extend(remaining);
                break;
            };
            let index = remaining
                .iter()
                .position(|e| e.event_id == duplicate_id)
                .ok_or_else(|| Error::Internal(format!("{duplicate_id} vanished from chunk")))?;
            non_overlapping.extend(&remaining[..index]);

            if expected.as_deref().is_none_or(|id| id == duplicate_id) {
                let stored = store
                    .get_by_event_id(&self.room_id, &duplicate_id)?
                    .ok_or_else(|| Error::Internal(format!("{duplicate_id} vanished from store")))?;
                if stored.key.fragment_id == entry.fragment_id() {
                    tracing::warn!(
                        room_id = %self.room_id,
                        fragment_id = %entry.fragment_id(),
                        event_id = %duplicate_id,
                        "overlap is in the fragment being filled, not linking it to itself"
                    );
                } else {
                    let fragment = txn
                        .timeline_fragments()?
                        .get(&self.room_id, stored.key.fragment_id)?
                        .ok_or_else(|| self.unknown(stored.key.fragment_id))?;
                    neighbour = Some(entry.create_neighbour_entry(fragment));
                }
                break;
            }

            // Known server quirk: the event is stored but in a fragment other
            // than the one we are linked to. Drop just this event.
            tracing::warn!(
                room_id = %self.room_id,
                fragment_id = %entry.fragment_id(),
                event_id = %duplicate_id,
                expected = ?expected,
                "event already stored in an unexpected fragment, skipping it"
            );
            remaining = &remaining[index + 1..];
        }

        Ok(Overlap {
            non_overlapping,
            neighbour,
        })
    }

    /// First occurrence of each id; a page may repeat one.
    fn unique_events<'a>(&self, events: &[&'a RoomEvent]) -> Vec<&'a RoomEvent> {
        let mut seen = HashSet::new();
        let unique: Vec<&RoomEvent> = events
            .iter()
            .copied()
            .filter(|event| seen.insert(event.event_id.as_str()))
            .collect();
        if unique.len() < events.len() {
            tracing::warn!(
                room_id = %self.room_id,
                dropped = events.len() - unique.len(),
                "pagination chunk repeated event ids"
            );
        }
        unique
    }

    fn store_events(
        &self,
        events: &[&RoomEvent],
        mut key: EventKey,
        direction: Direction,
        txn: &Txn,
    ) -> Result<Vec<TimelineEntry>> {
        let store = txn.timeline_events()?;
        let mut entries = Vec::with_capacity(events.len() + 2);
        for event in events {
            key = key.next_key_for_direction(direction)?;
            let stored = StoredEvent::new(&self.room_id, key, (*event).clone());
            store.insert(&stored)?;
            directional_append(&mut entries, EventEntry::from(stored).into(), direction);
        }
        Ok(entries)
    }

    fn update_fragments(
        &self,
        mut entry: FragmentBoundaryEntry,
        neighbour: Option<FragmentBoundaryEntry>,
        end: Option<String>,
        entries: &mut Vec<TimelineEntry>,
        txn: &Txn,
    ) -> Result<Vec<Fragment>> {
        let direction = entry.direction();
        let fragments = txn.timeline_fragments()?;
        let mut changed = Vec::new();

        if let Some(mut neighbour) = neighbour {
            self.link(&mut entry, neighbour.fragment_id())?;
            self.link(&mut neighbour, entry.fragment_id())?;
            // Overlapping events mean there is nothing left to paginate.
            entry.set_token(None);
            neighbour.set_token(None);
            fragments.update(&neighbour.fragment)?;
            tracing::info!(
                room_id = %self.room_id,
                fragment_id = %entry.fragment_id(),
                neighbour = %neighbour.fragment_id(),
                %direction,
                "gap closed, fragments linked"
            );
            fragments.update(&entry.fragment)?;
            changed.push(entry.fragment.clone());
            changed.push(neighbour.fragment.clone());
            directional_append(entries, entry.into(), direction);
            directional_append(entries, neighbour.into(), direction);
        } else {
            match end {
                Some(end) => entry.set_token(Some(end)),
                // No further token: this edge is the start (or end) of history.
                None => entry.set_edge_reached(true),
            }
            fragments.update(&entry.fragment)?;
            changed.push(entry.fragment.clone());
            directional_append(entries, entry.into(), direction);
        }
        Ok(changed)
    }

    fn link(&self, entry: &mut FragmentBoundaryEntry, target: FragmentId) -> Result<()> {
        match entry.linked_fragment_id() {
            None => {
                entry.set_linked_fragment_id(target);
                Ok(())
            }
            Some(existing) if existing == target => Ok(()),
            Some(existing) => Err(Error::FragmentLinkConflict {
                room_id: self.room_id.clone(),
                fragment_id: entry.fragment_id(),
                direction: entry.direction().as_api_str(),
                existing,
                attempted: target,
            }),
        }
    }
}
