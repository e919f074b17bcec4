//! Reads windows of timeline entries out of storage.
//!
//! A read walks events inside one fragment, emits the fragment's boundary
//! once the fragment is exhausted, and continues into the linked neighbour
//! when nothing separates them. An edge carrying a token is a gap: reading
//! stops there and the boundary is left for the caller to fill.

use crate::error::{Error, Result};
use crate::model::{
    EventEntry, FragmentBoundaryEntry, TimelineEntry, directional_append, directional_concat,
};
use crate::ordering::{Direction, EventKey, FragmentId};
use crate::store::Txn;

/// Where the next batch of events starts.
#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Strictly beyond an event key.
    Key(EventKey),
    /// From the edge of a fragment, moving inward.
    Edge(FragmentId),
}

#[derive(Debug, Clone)]
pub struct TimelineReader {
    room_id: String,
}

impl TimelineReader {
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
        }
    }

    /// Up to `amount` entries beyond `key` along `direction`, oldest first.
    /// `key` itself is not included.
    ///
    /// # Errors
    ///
    /// Fails on storage errors, or with [`Error::UnknownFragment`] if a
    /// linked fragment is missing.
    pub fn read_from(
        &self,
        key: EventKey,
        direction: Direction,
        amount: usize,
        txn: &Txn,
    ) -> Result<Vec<TimelineEntry>> {
        self.read(Cursor::Key(key), direction, amount, txn)
    }

    /// The newest entries of the room: a backward read from the end of the
    /// live fragment, followed by that fragment's end boundary.
    ///
    /// Returns nothing for a room that has never synced.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn read_from_end(&self, amount: usize, txn: &Txn) -> Result<Vec<TimelineEntry>> {
        let Some(live) = txn.timeline_fragments()?.live_fragment(&self.room_id)? else {
            return Ok(Vec::new());
        };
        let mut entries = self.read(Cursor::Edge(live.id), Direction::Backward, amount, txn)?;
        entries.push(FragmentBoundaryEntry::end(live).into());
        Ok(entries)
    }

    fn read(
        &self,
        start: Cursor,
        direction: Direction,
        amount: usize,
        txn: &Txn,
    ) -> Result<Vec<TimelineEntry>> {
        let events = txn.timeline_events()?;
        let fragments = txn.timeline_fragments()?;
        let mut entries = Vec::new();
        let mut cursor = Some(start);

        while let Some(current) = cursor.take() {
            if entries.len() >= amount {
                break;
            }
            let remaining = amount - entries.len();
            let (fragment_id, batch) = match (current, direction) {
                (Cursor::Key(key), Direction::Forward) => {
                    (key.fragment_id, events.events_after(&self.room_id, key, remaining)?)
                }
                (Cursor::Key(key), Direction::Backward) => {
                    (key.fragment_id, events.events_before(&self.room_id, key, remaining)?)
                }
                (Cursor::Edge(id), Direction::Forward) => {
                    (id, events.first_events(&self.room_id, id, remaining)?)
                }
                (Cursor::Edge(id), Direction::Backward) => {
                    (id, events.last_events(&self.room_id, id, remaining)?)
                }
            };
            let batch = batch
                .into_iter()
                .map(|stored| EventEntry::from(stored).into())
                .collect();
            directional_concat(&mut entries, batch, direction);
            if entries.len() >= amount {
                break;
            }

            let fragment = fragments
                .get(&self.room_id, fragment_id)?
                .ok_or_else(|| self.unknown(fragment_id))?;
            let boundary = FragmentBoundaryEntry::facing(fragment, direction);
            let neighbour = match boundary.linked_fragment_id() {
                Some(linked) if boundary.token().is_none() => {
                    let fragment = fragments
                        .get(&self.room_id, linked)?
                        .ok_or_else(|| self.unknown(linked))?;
                    Some(boundary.create_neighbour_entry(fragment))
                }
                _ => None,
            };
            directional_append(&mut entries, boundary.into(), direction);

            if let Some(neighbour) = neighbour {
                if !neighbour.is_gap() {
                    cursor = Some(Cursor::Edge(neighbour.fragment_id()));
                }
                directional_append(&mut entries, neighbour.into(), direction);
            }
        }
        Ok(entries)
    }

    fn unknown(&self, fragment_id: FragmentId) -> Error {
        Error::UnknownFragment {
            room_id: self.room_id.clone(),
            fragment_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fragment, RoomEvent, StoredEvent};
    use crate::ordering::MIDDLE_INDEX;
    use crate::store::{Storage, StoreName};
    use serde_json::json;

    const STORES: [StoreName; 2] = [StoreName::TimelineEvents, StoreName::TimelineFragments];

    fn insert(txn: &Txn, fragment: u32, offset: u32, id: &str) {
        let key = EventKey::new(FragmentId(fragment), MIDDLE_INDEX + offset);
        let event = RoomEvent::new(id, "m.room.message", json!({"body": id}));
        txn.timeline_events()
            .expect("events")
            .insert(&StoredEvent::new("!r", key, event))
            .expect("insert");
    }

    /// F0 `$a $b` linked to F1 `$x $y`, no gap between them. F0 starts at a
    /// backward gap `p0`.
    async fn linked_pair(f1_previous_token: Option<&str>) -> Storage {
        let storage = Storage::open_in_memory().expect("open");
        let txn = storage.write_txn(&STORES).await.expect("txn");
        let fragments = txn.timeline_fragments().expect("fragments");
        fragments
            .add(
                &Fragment::new("!r", FragmentId(0))
                    .with_previous_token(Some("p0".into()))
                    .with_next(FragmentId(1)),
            )
            .expect("f0");
        fragments
            .add(
                &Fragment::new("!r", FragmentId(1))
                    .with_previous(FragmentId(0))
                    .with_previous_token(f1_previous_token.map(str::to_string)),
            )
            .expect("f1");
        insert(&txn, 0, 1, "$a");
        insert(&txn, 0, 2, "$b");
        insert(&txn, 1, 1, "$x");
        insert(&txn, 1, 2, "$y");
        txn.complete().expect("commit");
        storage
    }

    fn describe(entries: &[TimelineEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| match entry {
                TimelineEntry::Event(event) => event.event.event_id.clone(),
                TimelineEntry::FragmentBoundary(boundary) => format!(
                    "{}{}",
                    if boundary.is_start { "start" } else { "end" },
                    boundary.fragment_id()
                ),
                TimelineEntry::Pending(_) => "pending".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn read_from_end_crosses_closed_links_and_stops_at_gap() {
        let storage = linked_pair(None).await;
        let txn = storage.read_txn(&STORES).await.expect("txn");
        let entries = TimelineReader::new("!r")
            .read_from_end(50, &txn)
            .expect("read");
        assert_eq!(
            describe(&entries),
            ["start0", "$a", "$b", "end0", "start1", "$x", "$y", "end1"]
        );
        assert!(entries[0].as_boundary().expect("start").is_gap());
    }

    #[tokio::test]
    async fn open_gap_between_linked_fragments_stops_the_read() {
        let storage = linked_pair(Some("p1")).await;
        let txn = storage.read_txn(&STORES).await.expect("txn");
        let entries = TimelineReader::new("!r")
            .read_from_end(50, &txn)
            .expect("read");
        assert_eq!(describe(&entries), ["start1", "$x", "$y", "end1"]);
    }

    #[tokio::test]
    async fn amount_bounds_the_window() {
        let storage = linked_pair(None).await;
        let txn = storage.read_txn(&STORES).await.expect("txn");
        let reader = TimelineReader::new("!r");

        let newest = reader.read_from_end(2, &txn).expect("read");
        assert_eq!(describe(&newest), ["$x", "$y", "end1"]);

        let y = newest[1].as_event().expect("event").key;
        let older = reader
            .read_from(y, Direction::Backward, 3, &txn)
            .expect("read");
        assert_eq!(describe(&older), ["end0", "start1", "$x"]);
    }

    #[tokio::test]
    async fn forward_read_enters_the_next_fragment() {
        let storage = linked_pair(None).await;
        let txn = storage.read_txn(&STORES).await.expect("txn");
        let a = EventKey::new(FragmentId(0), MIDDLE_INDEX + 1);
        let entries = TimelineReader::new("!r")
            .read_from(a, Direction::Forward, 50, &txn)
            .expect("read");
        assert_eq!(describe(&entries), ["$b", "end0", "start1", "$x", "$y", "end1"]);
    }

    #[tokio::test]
    async fn empty_room_reads_nothing() {
        let storage = Storage::open_in_memory().expect("open");
        let txn = storage.read_txn(&STORES).await.expect("txn");
        assert!(
            TimelineReader::new("!r")
                .read_from_end(10, &txn)
                .expect("read")
                .is_empty()
        );
    }
}
