//! Message bus adapter: locked dispatch, command notifications and typed
//! domain-event routing over a [`BusTransport`](eventline_events::BusTransport).

pub mod bus_adapter;
mod router;

pub use bus_adapter::{LockScope, MessageBusAdapter};
