//! Infrastructure layer: event log, repository, bus adapter, locks, caching, read models.
//!
//! ```text
//! Command -> MessageBusAdapter (locked dispatch) -> handler -> Repository (load/save)
//!                                                               ↓ append + publish
//! ReadModelProjector <- envelope stream <- MessageBusAdapter <--+
//!         ↓ EntityStore write + CacheAdapter::remove_by_prefix
//! ```

pub mod cache;
pub mod config;
pub mod event_store;
pub mod lock;
pub mod messaging;
pub mod projections;
pub mod read_model;
pub mod repository;

pub use cache::{CacheAdapter, CacheError};
pub use config::{CacheOptions, LockOptions};
pub use messaging::{LockScope, MessageBusAdapter};
pub use projections::{ReadModelProjection, ReadModelProjector};
pub use repository::{Repository, RepositoryError};

#[cfg(test)]
pub(crate) mod testing;
