//! Append-only event log boundary.
//!
//! The log stores one stream per aggregate instance (`"{aggregate_type}-{aggregate_id}"`)
//! and enforces optimistic concurrency on append. Everything above it (repository,
//! publication, projections) treats the log as the source of truth.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventLog;
pub use r#trait::{EventLog, EventLogError, StoredEvent, UncommittedEvent, stream_name};
