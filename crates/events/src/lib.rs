//! `eventline-events`: message contracts and transport mechanics.
//!
//! - **Messages**: commands, domain-event envelopes, runtime notifications
//! - **Transport**: the [`BusTransport`] seam plus an in-memory implementation
//! - **Lifetime**: the process-wide stop signal handlers are linked to
//!
//! Locking, command notifications and typed domain-event routing are built on top
//! of these in `eventline-infra`.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod lifetime;
pub mod message;
pub mod notifications;
pub mod response;

pub use bus::{BusHandler, BusMessage, BusTransport, TransportError};
pub use command::Command;
pub use envelope::{AggregateDomainEventMessage, AggregateTypeInfo};
pub use event::{AggregateEvent, Event};
pub use in_memory_bus::InMemoryBusTransport;
pub use lifetime::ApplicationLifetime;
pub use message::{Message, MessageState};
pub use notifications::{
    CommandFailedNotification, CommandSucceededNotification, EntityChange, EntityChangedNotification,
};
pub use response::MessageResponse;
