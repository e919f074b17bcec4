//! Cross-fragment ordering over the fragment link graph.
//!
//! Fragments link to neighbours through `previous_id`/`next_id`. Following
//! those links partitions a room's fragments into *islands*: maximal chains
//! with a total order. Two fragments on different islands have no defined
//! order because an unfilled gap separates them.
//!
//! # Determinism
//!
//! Rebuilding walks fragments in ascending id order, so a fixed set of links
//! always yields the same islands and positions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::model::Fragment;
use crate::ordering::FragmentId;

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// The part of a fragment the comparer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Links {
    previous_id: Option<FragmentId>,
    next_id: Option<FragmentId>,
}

impl From<&Fragment> for Links {
    fn from(fragment: &Fragment) -> Self {
        Self {
            previous_id: fragment.previous_id,
            next_id: fragment.next_id,
        }
    }
}

/// Island membership and position of one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    island: usize,
    position: usize,
}

// ---------------------------------------------------------------------------
// FragmentComparer
// ---------------------------------------------------------------------------

/// Answers "is fragment A before fragment B" for one room.
#[derive(Debug, Clone, Default)]
pub struct FragmentComparer {
    room_id: String,
    fragments: BTreeMap<FragmentId, Links>,
    placements: HashMap<FragmentId, Placement>,
    island_count: usize,
}

impl FragmentComparer {
    /// Build a comparer from every fragment known for a room.
    #[must_use]
    pub fn new<'a>(fragments: impl IntoIterator<Item = &'a Fragment>) -> Self {
        let mut comparer = Self::default();
        comparer.rebuild(fragments);
        comparer
    }

    /// Replace the known link graph and recompute islands.
    pub fn rebuild<'a>(&mut self, fragments: impl IntoIterator<Item = &'a Fragment>) {
        self.fragments.clear();
        for fragment in fragments {
            self.remember_room(fragment);
            self.fragments.insert(fragment.id, Links::from(fragment));
        }
        self.recompute();
    }

    /// Register a fragment read from storage, replacing any previous copy.
    pub fn add(&mut self, fragment: &Fragment) {
        self.remember_room(fragment);
        self.fragments.insert(fragment.id, Links::from(fragment));
        self.recompute();
    }

    /// Register a new fragment that follows `previous_id`.
    pub fn append(&mut self, id: FragmentId, previous_id: FragmentId) {
        if let Some(previous) = self.fragments.get_mut(&previous_id) {
            previous.next_id = Some(id);
        }
        self.fragments.insert(
            id,
            Links {
                previous_id: Some(previous_id),
                next_id: None,
            },
        );
        self.recompute();
    }

    /// Register a new fragment that precedes `next_id`.
    pub fn prepend(&mut self, id: FragmentId, next_id: FragmentId) {
        if let Some(next) = self.fragments.get_mut(&next_id) {
            next.previous_id = Some(id);
        }
        self.fragments.insert(
            id,
            Links {
                previous_id: None,
                next_id: Some(next_id),
            },
        );
        self.recompute();
    }

    /// Order two fragments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownFragment`] for an id never registered, and
    /// [`Error::AmbiguousOrder`] when the fragments are on different islands.
    pub fn compare(&self, a: FragmentId, b: FragmentId) -> Result<Ordering> {
        if a == b {
            return Ok(Ordering::Equal);
        }
        let pa = self.placement(a)?;
        let pb = self.placement(b)?;
        if pa.island != pb.island {
            return Err(Error::AmbiguousOrder { a, b });
        }
        Ok(pa.position.cmp(&pb.position))
    }

    /// Returns `true` when both fragments are known and share an island.
    #[must_use]
    pub fn same_island(&self, a: FragmentId, b: FragmentId) -> bool {
        match (self.placements.get(&a), self.placements.get(&b)) {
            (Some(pa), Some(pb)) => pa.island == pb.island,
            _ => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: FragmentId) -> bool {
        self.fragments.contains_key(&id)
    }

    #[must_use]
    pub const fn island_count(&self) -> usize {
        self.island_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    fn placement(&self, id: FragmentId) -> Result<Placement> {
        self.placements
            .get(&id)
            .copied()
            .ok_or_else(|| Error::UnknownFragment {
                room_id: self.room_id.clone(),
                fragment_id: id,
            })
    }

    fn remember_room(&mut self, fragment: &Fragment) {
        if self.room_id.is_empty() {
            self.room_id.clone_from(&fragment.room_id);
        }
    }

    fn recompute(&mut self) {
        let mut remaining: HashSet<FragmentId> = self.fragments.keys().copied().collect();
        let mut placements = HashMap::with_capacity(self.fragments.len());
        let mut island = 0;

        for &seed in self.fragments.keys() {
            if !remaining.contains(&seed) {
                continue;
            }

            // Walk back to the head of the chain. The visited set guards
            // against a corrupt cyclic chain.
            let mut head = seed;
            let mut visited = HashSet::from([seed]);
            while let Some(previous) = self.fragments.get(&head).and_then(|l| l.previous_id) {
                if !remaining.contains(&previous) || !visited.insert(previous) {
                    break;
                }
                head = previous;
            }

            let mut position = 0;
            let mut cursor = Some(head);
            while let Some(id) = cursor {
                if !remaining.remove(&id) {
                    break;
                }
                placements.insert(id, Placement { island, position });
                position += 1;
                cursor = self.fragments.get(&id).and_then(|l| l.next_id);
            }
            island += 1;
        }

        self.placements = placements;
        self.island_count = island;
    }
}
