//! Read-model projections.
//!
//! A [`ReadModelProjection`] decides what an event means for one read entity type;
//! the [`ReadModelProjector`] runs it under the entity locks, persists the result,
//! invalidates the type's query caches and emits live-update notifications.

pub mod context;
pub mod projector;

pub use context::{EntityDescriptor, ProjectionContext};
pub use projector::{ProjectionError, ReadModelProjection, ReadModelProjector};
