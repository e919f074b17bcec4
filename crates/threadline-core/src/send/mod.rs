//! Outgoing events: the per-room [`SendQueue`] and the shared
//! [`SendScheduler`] every queue sends through.

pub mod queue;
pub mod scheduler;

pub use queue::{PendingUpdate, SendQueue};
pub use scheduler::SendScheduler;
