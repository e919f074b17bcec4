//! Event ordering primitives.
//!
//! An [`EventKey`] is a `(fragment, index)` pair. Keys in the same fragment
//! order by index; keys in different fragments order through the
//! [`FragmentComparer`], which only answers for fragments on the same island.
//!
//! # Index space
//!
//! Indices are `u32`. A fragment's first key sits at [`MIDDLE_INDEX`] so the
//! sync writer can grow it forward and the gap writer backward without either
//! running out of room in practice.

pub mod comparer;

pub use comparer::FragmentComparer;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest storable event index.
pub const MIN_INDEX: u32 = u32::MIN;
/// Starting index of every fragment.
pub const MIDDLE_INDEX: u32 = 0x7FFF_FFFF;
/// Largest storable event index.
pub const MAX_INDEX: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// FragmentId
// ---------------------------------------------------------------------------

/// Identifier of a fragment within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentId(pub u32);

impl FragmentId {
    /// The id given to the first live fragment of a room.
    pub const FIRST: Self = Self(0);

    /// Reserved id for local echoes that are not stored in any fragment yet.
    /// Sorts after every persisted fragment.
    pub const PENDING: Self = Self(u32::MAX);

    /// The id following this one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeySpaceExhausted`] when the next id would collide
    /// with [`FragmentId::PENDING`].
    pub fn next(self) -> Result<Self> {
        match self.0.checked_add(1) {
            Some(next) if next != Self::PENDING.0 => Ok(Self(next)),
            _ => Err(Error::KeySpaceExhausted(self)),
        }
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        self.0 == Self::PENDING.0
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Pagination direction relative to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "b")]
    Backward,
    #[serde(rename = "f")]
    Forward,
}

impl Direction {
    #[must_use]
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }

    #[must_use]
    pub const fn is_backward(self) -> bool {
        matches!(self, Self::Backward)
    }

    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Backward => Self::Forward,
            Self::Forward => Self::Backward,
        }
    }

    /// The `dir` parameter of the `/messages` endpoint.
    #[must_use]
    pub const fn as_api_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
        })
    }
}

// ---------------------------------------------------------------------------
// EventKey
// ---------------------------------------------------------------------------

/// Storage position of a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub fragment_id: FragmentId,
    pub event_index: u32,
}

impl EventKey {
    #[must_use]
    pub const fn new(fragment_id: FragmentId, event_index: u32) -> Self {
        Self {
            fragment_id,
            event_index,
        }
    }

    /// The key the first live fragment of a room starts at.
    #[must_use]
    pub const fn default_live_key() -> Self {
        Self::default_fragment_key(FragmentId::FIRST)
    }

    /// The starting key of a fragment that has no events yet.
    #[must_use]
    pub const fn default_fragment_key(fragment_id: FragmentId) -> Self {
        Self::new(fragment_id, MIDDLE_INDEX)
    }

    /// # Errors
    ///
    /// Returns [`Error::KeySpaceExhausted`] at [`MAX_INDEX`].
    pub fn next_key(self) -> Result<Self> {
        self.event_index
            .checked_add(1)
            .map(|index| Self::new(self.fragment_id, index))
            .ok_or(Error::KeySpaceExhausted(self.fragment_id))
    }

    /// # Errors
    ///
    /// Returns [`Error::KeySpaceExhausted`] at [`MIN_INDEX`].
    pub fn previous_key(self) -> Result<Self> {
        self.event_index
            .checked_sub(1)
            .map(|index| Self::new(self.fragment_id, index))
            .ok_or(Error::KeySpaceExhausted(self.fragment_id))
    }

    /// # Errors
    ///
    /// Returns [`Error::KeySpaceExhausted`] at either end of the index space.
    pub fn next_key_for_direction(self, direction: Direction) -> Result<Self> {
        match direction {
            Direction::Forward => self.next_key(),
            Direction::Backward => self.previous_key(),
        }
    }

    /// The starting key of the fragment that follows this key's fragment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeySpaceExhausted`] when no fragment id is left.
    pub fn next_fragment_key(self) -> Result<Self> {
        Ok(Self::default_fragment_key(self.fragment_id.next()?))
    }

    /// Widened index used when comparing against fragment boundaries.
    #[must_use]
    pub fn entry_index(self) -> i64 {
        i64::from(self.event_index)
    }

    /// Order two keys, consulting the fragment graph across fragments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AmbiguousOrder`] when the fragments are on different
    /// islands, or [`Error::UnknownFragment`] when the comparer has not seen
    /// one of them.
    pub fn compare(&self, other: &Self, comparer: &FragmentComparer) -> Result<Ordering> {
        compare_positions(
            (self.fragment_id, self.entry_index()),
            (other.fragment_id, other.entry_index()),
            comparer,
        )
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.fragment_id, self.event_index)
    }
}

/// Compare two `(fragment, entry index)` positions.
///
/// Pending positions sort after everything persisted.
///
/// # Errors
///
/// Propagates [`FragmentComparer::compare`] failures.
pub fn compare_positions(
    a: (FragmentId, i64),
    b: (FragmentId, i64),
    comparer: &FragmentComparer,
) -> Result<Ordering> {
    if a.0 == b.0 {
        return Ok(a.1.cmp(&b.1));
    }
    if a.0.is_pending() {
        return Ok(Ordering::Greater);
    }
    if b.0.is_pending() {
        return Ok(Ordering::Less);
    }
    comparer.compare(a.0, b.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Fragment;

    #[test]
    fn next_and_previous_keys_stay_in_fragment() {
        let key = EventKey::new(FragmentId(3), 10);
        assert_eq!(key.next_key().expect("next"), EventKey::new(FragmentId(3), 11));
        assert_eq!(
            key.previous_key().expect("previous"),
            EventKey::new(FragmentId(3), 9)
        );
        assert_eq!(
            key.next_key_for_direction(Direction::Backward).expect("dir"),
            EventKey::new(FragmentId(3), 9)
        );
    }

    #[test]
    fn next_fragment_key_jumps_to_middle() {
        let key = EventKey::new(FragmentId(1), 5);
        assert_eq!(
            key.next_fragment_key().expect("next fragment"),
            EventKey::new(FragmentId(2), MIDDLE_INDEX)
        );
    }

    #[test]
    fn index_space_edges_are_errors_not_wraps() {
        let top = EventKey::new(FragmentId(0), MAX_INDEX);
        assert!(matches!(top.next_key(), Err(Error::KeySpaceExhausted(_))));
        let bottom = EventKey::new(FragmentId(0), MIN_INDEX);
        assert!(matches!(
            bottom.previous_key(),
            Err(Error::KeySpaceExhausted(_))
        ));
        assert!(FragmentId(u32::MAX - 1).next().is_err());
    }

    #[test]
    fn same_fragment_compares_numerically_without_comparer_knowledge() {
        let comparer = FragmentComparer::default();
        let a = EventKey::new(FragmentId(9), 1);
        let b = EventKey::new(FragmentId(9), 2);
        assert_eq!(a.compare(&b, &comparer).expect("cmp"), Ordering::Less);
    }

    #[test]
    fn cross_fragment_uses_links_and_fails_across_islands() {
        let comparer = FragmentComparer::new(&[
            Fragment::new("!r", FragmentId(0)).with_next(FragmentId(1)),
            Fragment::new("!r", FragmentId(1)).with_previous(FragmentId(0)),
            Fragment::new("!r", FragmentId(5)),
        ]);
        let early = EventKey::new(FragmentId(0), MAX_INDEX);
        let late = EventKey::new(FragmentId(1), MIN_INDEX);
        assert_eq!(early.compare(&late, &comparer).expect("cmp"), Ordering::Less);

        let island = EventKey::new(FragmentId(5), MIDDLE_INDEX);
        assert!(matches!(
            early.compare(&island, &comparer),
            Err(Error::AmbiguousOrder { .. })
        ));
    }

    #[test]
    fn pending_sorts_after_persisted() {
        let comparer = FragmentComparer::default();
        assert_eq!(
            compare_positions((FragmentId::PENDING, 0), (FragmentId(7), 100), &comparer)
                .expect("cmp"),
            Ordering::Greater
        );
        assert_eq!(
            compare_positions((FragmentId(7), 100), (FragmentId::PENDING, 0), &comparer)
                .expect("cmp"),
            Ordering::Less
        );
    }
}
