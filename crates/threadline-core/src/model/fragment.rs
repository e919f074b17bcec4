use serde::{Deserialize, Serialize};

use crate::ordering::{Direction, FragmentId};

/// A contiguous run of causally ordered events bounded by two edges.
///
/// Each edge is one of:
/// - a link to a neighbour fragment (`previous_id`/`next_id`)
/// - a gap: a pagination token without a neighbour
/// - the end of known history: neither token nor neighbour
///
/// The fragment with no `next_id` and no `next_token` is the room's live
/// fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub room_id: String,
    pub id: FragmentId,
    pub previous_id: Option<FragmentId>,
    pub next_id: Option<FragmentId>,
    pub previous_token: Option<String>,
    pub next_token: Option<String>,
    /// Backward pagination returned nothing: this is the room's creation.
    pub start_reached: bool,
    /// Forward pagination returned nothing.
    pub end_reached: bool,
}

impl Fragment {
    #[must_use]
    pub fn new(room_id: impl Into<String>, id: FragmentId) -> Self {
        Self {
            room_id: room_id.into(),
            id,
            previous_id: None,
            next_id: None,
            previous_token: None,
            next_token: None,
            start_reached: false,
            end_reached: false,
        }
    }

    #[must_use]
    pub const fn with_previous(mut self, previous_id: FragmentId) -> Self {
        self.previous_id = Some(previous_id);
        self
    }

    #[must_use]
    pub const fn with_next(mut self, next_id: FragmentId) -> Self {
        self.next_id = Some(next_id);
        self
    }

    #[must_use]
    pub fn with_previous_token(mut self, token: Option<String>) -> Self {
        self.previous_token = token;
        self
    }

    #[must_use]
    pub fn with_next_token(mut self, token: Option<String>) -> Self {
        self.next_token = token;
        self
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.next_id.is_none() && self.next_token.is_none()
    }

    /// Neighbour across the edge facing `direction`.
    #[must_use]
    pub const fn linked_id(&self, direction: Direction) -> Option<FragmentId> {
        match direction {
            Direction::Backward => self.previous_id,
            Direction::Forward => self.next_id,
        }
    }

    /// Token of the edge facing `direction`.
    #[must_use]
    pub fn token(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Backward => self.previous_token.as_deref(),
            Direction::Forward => self.next_token.as_deref(),
        }
    }

    #[must_use]
    pub const fn edge_reached(&self, direction: Direction) -> bool {
        match direction {
            Direction::Backward => self.start_reached,
            Direction::Forward => self.end_reached,
        }
    }

    pub const fn set_linked_id(&mut self, direction: Direction, id: Option<FragmentId>) {
        match direction {
            Direction::Backward => self.previous_id = id,
            Direction::Forward => self.next_id = id,
        }
    }

    pub fn set_token(&mut self, direction: Direction, token: Option<String>) {
        match direction {
            Direction::Backward => self.previous_token = token,
            Direction::Forward => self.next_token = token,
        }
    }

    pub const fn set_edge_reached(&mut self, direction: Direction, reached: bool) {
        match direction {
            Direction::Backward => self.start_reached = reached,
            Direction::Forward => self.end_reached = reached,
        }
    }
}
