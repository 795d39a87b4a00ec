use serde::Serialize;
use serde::de::DeserializeOwned;

use eventline_core::Aggregate;

/// A domain event payload (usually an aggregate's event enum).
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - **tagged** with a stable type name used for routing
pub trait Event: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "order.created").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }
}

/// Typed view over one event type of an aggregate.
///
/// Implemented by the per-variant payload types so a subscriber can register for
/// exactly one `(aggregate type, event type)` pair and receive that payload.
pub trait AggregateEvent: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Aggregate: Aggregate;

    /// Must equal `event_type()` of the matching aggregate event.
    const EVENT_TYPE: &'static str;

    /// Extract this payload from the aggregate's event enum.
    fn from_event(event: <Self::Aggregate as Aggregate>::Event) -> Option<Self>;
}
