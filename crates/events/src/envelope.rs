use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventline_core::{Aggregate, AggregateId, DomainEvent, UserId};

use crate::event::{AggregateEvent, Event};
use crate::message::{Message, MessageState};

/// Envelope for a committed domain event, published after a successful append.
///
/// All domain events travel on this single message type. Subscribers pick the
/// events they care about through the type tags instead of subscribing to one
/// transport topic per concrete event type.
///
/// - `aggregate_type` is the [`Aggregate::AGGREGATE_TYPE`] of the emitting aggregate.
/// - `domain_event_type` is the [`Event::event_type`] of the payload.
/// - `domain_event_content` is the serialized aggregate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDomainEventMessage {
    event_id: Uuid,
    aggregate_type: String,
    aggregate_id: AggregateId,
    domain_event_type: String,

    /// Position in the aggregate stream.
    version: i64,
    time_stamp_utc: DateTime<Utc>,
    user_id: Option<UserId>,

    domain_event_content: JsonValue,
    #[serde(default)]
    properties: MessageState,
}

impl Message for AggregateDomainEventMessage {
    const MESSAGE_TYPE: &'static str = "eventline.aggregate_domain_event";
}

impl AggregateDomainEventMessage {
    /// Wrap a committed domain event of aggregate `A`.
    pub fn from_domain_event<A>(
        event: &DomainEvent<A::Event>,
        properties: MessageState,
    ) -> Result<Self, serde_json::Error>
    where
        A: Aggregate,
        A::Event: Event,
    {
        Ok(Self {
            event_id: event.id,
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            aggregate_id: event.aggregate_id,
            domain_event_type: event.payload.event_type().to_string(),
            version: event.version,
            time_stamp_utc: event.time_stamp_utc,
            user_id: event.user_id,
            domain_event_content: serde_json::to_value(&event.payload)?,
            properties,
        })
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn domain_event_type(&self) -> &str {
        &self.domain_event_type
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn time_stamp_utc(&self) -> DateTime<Utc> {
        self.time_stamp_utc
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn content(&self) -> &JsonValue {
        &self.domain_event_content
    }

    pub fn properties(&self) -> &MessageState {
        &self.properties
    }

    pub fn is_aggregate<A: Aggregate>(&self) -> bool {
        self.aggregate_type == A::AGGREGATE_TYPE
    }

    pub fn is_event_type<E: AggregateEvent>(&self) -> bool {
        self.domain_event_type == E::EVENT_TYPE
    }

    /// Deserialize the payload as the aggregate's event enum.
    pub fn event<A>(&self) -> Result<A::Event, serde_json::Error>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        serde_json::from_value(self.domain_event_content.clone())
    }

    /// Deserialize the payload and narrow it to the typed event `E`.
    ///
    /// Returns `Ok(None)` when the envelope belongs to another aggregate or event type.
    pub fn typed_event<E>(&self) -> Result<Option<E>, serde_json::Error>
    where
        E: AggregateEvent,
        <E::Aggregate as Aggregate>::Event: DeserializeOwned,
    {
        if !self.is_aggregate::<E::Aggregate>() || !self.is_event_type::<E>() {
            return Ok(None);
        }
        Ok(E::from_event(self.event::<E::Aggregate>()?))
    }
}

/// Aggregate identity handed to typed domain-event handlers.
#[derive(Debug)]
pub struct AggregateTypeInfo<A> {
    aggregate_id: AggregateId,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> AggregateTypeInfo<A> {
    pub fn new(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            _aggregate: PhantomData,
        }
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_name(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }
}

impl<A> Clone for AggregateTypeInfo<A> {
    fn clone(&self) -> Self {
        Self {
            aggregate_id: self.aggregate_id,
            _aggregate: PhantomData,
        }
    }
}
