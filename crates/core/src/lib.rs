//! `eventline-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, DomainEvent, ExpectedVersion, NEW_AGGREGATE_VERSION};
pub use entity::{Entity, entity_cache_key};
pub use error::DomainError;
pub use id::{AggregateId, MessageId, UserId};
