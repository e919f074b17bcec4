//! Domain types shared by the writers, the reader and the send queue.

pub mod entry;
pub mod event;
pub mod fragment;
pub mod pending;
pub mod summary;

pub use entry::{
    EventEntry, FragmentBoundaryEntry, PendingEntry, TimelineEntry, directional_append,
    directional_concat,
};
pub use event::{Membership, RoomEvent, StoredEvent, Unsigned};
pub use fragment::Fragment;
pub use pending::{PendingEvent, make_txn_id};
pub use summary::SummaryData;
