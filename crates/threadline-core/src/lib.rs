//! threadline-core library.
//!
//! Gap-aware timeline synchronization and persistence for federated chat
//! clients. Events from `/sync` and `/messages` land in *fragments*: runs of
//! contiguous events linked to their neighbours once the gap between them is
//! filled. [`room::Room`] ties a room's writers, fragment comparer, send queue
//! and observable [`timeline::Timeline`] together; [`client::SessionContainer`]
//! wires rooms to the sync loop and the reconnector.
//!
//! # Conventions
//!
//! - **Errors**: library operations return [`Result`] with the typed [`Error`].
//! - **Logging**: use `tracing` macros with structured fields (`room_id`, ...).
//! - **Storage**: every multi-store write happens inside one [`store::Txn`];
//!   memory is updated only after that transaction commits.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod net;
pub mod ordering;
pub mod room;
pub mod send;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod timeline;

pub use client::SessionContainer;
pub use config::ClientConfig;
pub use error::{Error, ErrorCode, Result};
pub use model::TimelineEntry;
pub use net::{ConnectionStatus, HomeServerApi};
pub use ordering::{Direction, EventKey, FragmentComparer, FragmentId};
pub use room::Room;
pub use session::Session;
pub use store::Storage;
pub use sync::{SyncLoop, SyncStatus};
pub use timeline::{Timeline, TimelineUpdate};
