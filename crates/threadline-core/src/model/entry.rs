//! Timeline entries: events, fragment boundaries and local echoes.
//!
//! Every entry has a position `(fragment_id, entry_index)`. Ordering is
//! implemented once, on that pair, in [`TimelineEntry::compare`]:
//! - events use their stored event index
//! - a fragment's start boundary sorts before all of its events, the end
//!   boundary after them
//! - pending entries live in [`FragmentId::PENDING`] ordered by queue index

use std::cmp::Ordering;

use crate::error::Result;
use crate::model::{Fragment, PendingEvent, RoomEvent, StoredEvent};
use crate::ordering::{Direction, EventKey, FragmentComparer, FragmentId, compare_positions};

// ---------------------------------------------------------------------------
// EventEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    pub key: EventKey,
    pub event: RoomEvent,
}

impl From<StoredEvent> for EventEntry {
    fn from(stored: StoredEvent) -> Self {
        Self {
            key: stored.key,
            event: stored.event,
        }
    }
}

// ---------------------------------------------------------------------------
// FragmentBoundaryEntry
// ---------------------------------------------------------------------------

/// One edge of a fragment as it appears in the timeline.
///
/// A start boundary faces backward in time, an end boundary forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBoundaryEntry {
    pub fragment: Fragment,
    pub is_start: bool,
}

impl FragmentBoundaryEntry {
    #[must_use]
    pub const fn start(fragment: Fragment) -> Self {
        Self {
            fragment,
            is_start: true,
        }
    }

    #[must_use]
    pub const fn end(fragment: Fragment) -> Self {
        Self {
            fragment,
            is_start: false,
        }
    }

    /// The boundary of `fragment` facing `direction`.
    #[must_use]
    pub const fn facing(fragment: Fragment, direction: Direction) -> Self {
        Self {
            fragment,
            is_start: direction.is_backward(),
        }
    }

    #[must_use]
    pub const fn fragment_id(&self) -> FragmentId {
        self.fragment.id
    }

    #[must_use]
    pub const fn entry_index(&self) -> i64 {
        if self.is_start { i64::MIN } else { i64::MAX }
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        if self.is_start {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.fragment.token(self.direction())
    }

    pub fn set_token(&mut self, token: Option<String>) {
        let direction = self.direction();
        self.fragment.set_token(direction, token);
    }

    #[must_use]
    pub const fn linked_fragment_id(&self) -> Option<FragmentId> {
        self.fragment.linked_id(self.direction())
    }

    pub const fn set_linked_fragment_id(&mut self, id: FragmentId) {
        let direction = self.direction();
        self.fragment.set_linked_id(direction, Some(id));
    }

    #[must_use]
    pub const fn has_linked_fragment(&self) -> bool {
        self.linked_fragment_id().is_some()
    }

    #[must_use]
    pub const fn edge_reached(&self) -> bool {
        self.fragment.edge_reached(self.direction())
    }

    pub const fn set_edge_reached(&mut self, reached: bool) {
        let direction = self.direction();
        self.fragment.set_edge_reached(direction, reached);
    }

    /// More history exists beyond this edge on the server.
    #[must_use]
    pub fn is_gap(&self) -> bool {
        self.token().is_some() && !self.edge_reached()
    }

    /// Same edge, refreshed fragment.
    #[must_use]
    pub const fn with_updated_fragment(&self, fragment: Fragment) -> Self {
        Self {
            fragment,
            is_start: self.is_start,
        }
    }

    /// The facing edge of a neighbour fragment across this boundary.
    #[must_use]
    pub const fn create_neighbour_entry(&self, neighbour: Fragment) -> Self {
        Self {
            fragment: neighbour,
            is_start: !self.is_start,
        }
    }
}

// ---------------------------------------------------------------------------
// PendingEntry
// ---------------------------------------------------------------------------

/// Local echo of an event waiting in the send queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub pending: PendingEvent,
}

// ---------------------------------------------------------------------------
// TimelineEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Event(EventEntry),
    FragmentBoundary(FragmentBoundaryEntry),
    Pending(PendingEntry),
}

impl TimelineEntry {
    #[must_use]
    pub const fn fragment_id(&self) -> FragmentId {
        match self {
            Self::Event(entry) => entry.key.fragment_id,
            Self::FragmentBoundary(entry) => entry.fragment_id(),
            Self::Pending(_) => FragmentId::PENDING,
        }
    }

    #[must_use]
    pub fn entry_index(&self) -> i64 {
        match self {
            Self::Event(entry) => entry.key.entry_index(),
            Self::FragmentBoundary(entry) => entry.entry_index(),
            Self::Pending(entry) => i64::try_from(entry.pending.queue_index).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub fn position(&self) -> (FragmentId, i64) {
        (self.fragment_id(), self.entry_index())
    }

    /// Order two entries.
    ///
    /// # Errors
    ///
    /// Fails when the entries sit in fragments on different islands.
    pub fn compare(&self, other: &Self, comparer: &FragmentComparer) -> Result<Ordering> {
        compare_positions(self.position(), other.position(), comparer)
    }

    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Event(entry) => Some(&entry.event.event_id),
            Self::Pending(entry) => entry.pending.remote_id.as_deref(),
            Self::FragmentBoundary(_) => None,
        }
    }

    #[must_use]
    pub const fn as_event(&self) -> Option<&EventEntry> {
        match self {
            Self::Event(entry) => Some(entry),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_boundary(&self) -> Option<&FragmentBoundaryEntry> {
        match self {
            Self::FragmentBoundary(entry) => Some(entry),
            _ => None,
        }
    }
}

impl From<EventEntry> for TimelineEntry {
    fn from(entry: EventEntry) -> Self {
        Self::Event(entry)
    }
}

impl From<FragmentBoundaryEntry> for TimelineEntry {
    fn from(entry: FragmentBoundaryEntry) -> Self {
        Self::FragmentBoundary(entry)
    }
}

impl From<PendingEvent> for TimelineEntry {
    fn from(pending: PendingEvent) -> Self {
        Self::Pending(PendingEntry { pending })
    }
}

/// Push `entry` so that `entries` stays ordered along `direction`.
///
/// Writers and the reader produce entries moving away from a known point;
/// backward results are prepended so every returned list reads oldest first.
pub fn directional_append(
    entries: &mut Vec<TimelineEntry>,
    entry: TimelineEntry,
    direction: Direction,
) {
    match direction {
        Direction::Forward => entries.push(entry),
        Direction::Backward => entries.insert(0, entry),
    }
}

/// Concatenate `more` onto `entries` along `direction`. `more` is oldest first.
pub fn directional_concat(
    entries: &mut Vec<TimelineEntry>,
    more: Vec<TimelineEntry>,
    direction: Direction,
) {
    match direction {
        Direction::Forward => entries.extend(more),
        Direction::Backward => {
            let tail = std::mem::replace(entries, more);
            entries.extend(tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_entry(fragment: u32, index: u32) -> TimelineEntry {
        EventEntry {
            key: EventKey::new(FragmentId(fragment), index),
            event: RoomEvent::new(format!("${fragment}-{index}"), "m.room.message", json!({})),
        }
        .into()
    }

    #[test]
    fn boundaries_bracket_their_fragment() {
        let comparer = FragmentComparer::new(&[Fragment::new("!r", FragmentId(0))]);
        let start: TimelineEntry =
            FragmentBoundaryEntry::start(Fragment::new("!r", FragmentId(0))).into();
        let end: TimelineEntry =
            FragmentBoundaryEntry::end(Fragment::new("!r", FragmentId(0))).into();
        let first = event_entry(0, 0);
        let last = event_entry(0, u32::MAX);

        assert_eq!(start.compare(&first, &comparer).expect("cmp"), Ordering::Less);
        assert_eq!(last.compare(&end, &comparer).expect("cmp"), Ordering::Less);
    }

    #[test]
    fn gap_requires_token_and_unreached_edge() {
        let fragment = Fragment::new("!r", FragmentId(0)).with_previous_token(Some("p".into()));
        let mut start = FragmentBoundaryEntry::start(fragment);
        assert!(start.is_gap());
        assert_eq!(start.direction(), Direction::Backward);
        start.set_edge_reached(true);
        assert!(!start.is_gap());

        let end = FragmentBoundaryEntry::end(Fragment::new("!r", FragmentId(0)));
        assert!(!end.is_gap());
    }

    #[test]
    fn neighbour_entry_faces_the_other_way() {
        let start = FragmentBoundaryEntry::start(Fragment::new("!r", FragmentId(1)));
        let neighbour = start.create_neighbour_entry(Fragment::new("!r", FragmentId(0)));
        assert!(!neighbour.is_start);
        assert_eq!(neighbour.direction(), Direction::Forward);
    }

    #[test]
    fn directional_helpers_keep_oldest_first() {
        let mut entries = vec![event_entry(0, 10)];
        directional_append(&mut entries, event_entry(0, 9), Direction::Backward);
        directional_concat(
            &mut entries,
            vec![event_entry(0, 7), event_entry(0, 8)],
            Direction::Backward,
        );
        directional_append(&mut entries, event_entry(0, 11), Direction::Forward);
        let indices: Vec<i64> = entries.iter().map(TimelineEntry::entry_index).collect();
        assert_eq!(indices, vec![7, 8, 9, 10, 11]);
    }
}
