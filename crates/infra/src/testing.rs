//! Test doubles shared by the unit and integration tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use eventline_core::{Aggregate, AggregateId, DomainError, DomainEvent, Entity};
use eventline_events::{AggregateDomainEventMessage, AggregateEvent, Event, MessageState};

use crate::cache::{CacheStore, CacheStoreError, InMemoryCacheStore};
use crate::projections::{ProjectionError, ReadModelProjection, ReadModelProjector};
use crate::read_model::{EntityStore, EntityStoreError, InMemoryEntityStore, JsonPredicate};

/// Cache store that counts every call before delegating to an in-memory store.
#[derive(Debug, Default)]
pub struct SpyCacheStore {
    inner: InMemoryCacheStore,
    calls: AtomicUsize,
}

impl SpyCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl CacheStore for SpyCacheStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheStoreError> {
        self.touch();
        self.inner.get(key).await
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, JsonValue>, CacheStoreError> {
        self.touch();
        self.inner.get_all(keys).await
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        self.touch();
        self.inner.set(key, value, ttl).await
    }

    async fn add(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<bool, CacheStoreError> {
        self.touch();
        self.inner.add(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.touch();
        self.inner.exists(key).await
    }

    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheStoreError> {
        self.touch();
        self.inner.get_set(key).await
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        self.touch();
        self.inner.set_add(key, members, ttl).await
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), CacheStoreError> {
        self.touch();
        self.inner.set_remove(key, members).await
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.touch();
        self.inner.remove(key).await
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
        self.touch();
        self.inner.remove_by_prefix(prefix).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), CacheStoreError> {
        self.touch();
        self.inner.set_expiration(key, ttl).await
    }
}

/// Entity store that counts backing queries and can slow them down to widen races.
#[derive(Debug, Default)]
pub struct CountingEntityStore {
    inner: InMemoryEntityStore,
    queries: AtomicUsize,
    id_loads: AtomicUsize,
    query_delay: Option<Duration>,
}

impl CountingEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn id_loads(&self) -> usize {
        self.id_loads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EntityStore for CountingEntityStore {
    async fn get(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, EntityStoreError> {
        self.inner.get(entity_type, id, cancel).await
    }

    async fn query(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.query(entity_type, predicate, cancel).await
    }

    async fn get_many(
        &self,
        entity_type: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        self.id_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_many(entity_type, ids, cancel).await
    }

    async fn put(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        self.inner.put(entity_type, id, value, cancel).await
    }

    async fn replace(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        self.inner.replace(entity_type, id, value, cancel).await
    }

    async fn put_many(
        &self,
        entity_type: &str,
        rows: Vec<(String, JsonValue)>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        self.inner.put_many(entity_type, rows, cancel).await
    }

    async fn remove(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EntityStoreError> {
        self.inner.remove(entity_type, id, cancel).await
    }

    async fn remove_where(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        self.inner.remove_where(entity_type, predicate, cancel).await
    }

    async fn clear(&self, entity_type: &str, cancel: &CancellationToken) -> Result<usize, EntityStoreError> {
        self.inner.clear(entity_type, cancel).await
    }
}

/// Small read entity used across tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub id: String,
    pub title: String,
    pub open: bool,
}

impl Entity for OrderView {
    const ENTITY_TYPE: &'static str = "Order";

    fn entity_id(&self) -> &str {
        &self.id
    }
}

pub fn order_view(id: &str, title: &str, open: bool) -> OrderView {
    OrderView {
        id: id.to_string(),
        title: title.to_string(),
        open,
    }
}

/// Write-side aggregate the `OrderView` read model is projected from.
#[derive(Debug, Clone, Default)]
pub struct Order {
    pub title: Option<String>,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created { title: String },
    Renamed { title: String },
    Closed,
    Archived,
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created { .. } => OrderCreated::EVENT_TYPE,
            OrderEvent::Renamed { .. } => OrderRenamed::EVENT_TYPE,
            OrderEvent::Closed => OrderClosed::EVENT_TYPE,
            OrderEvent::Archived => "order.archived",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OrderCommand {
    Create { title: String },
    Rename { title: String },
    Close,
    Archive,
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "Order";

    fn new(_id: AggregateId) -> Self {
        Self::default()
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created { title } => {
                self.title = Some(title.clone());
                self.open = true;
            }
            OrderEvent::Renamed { title } => self.title = Some(title.clone()),
            OrderEvent::Closed => self.open = false,
            OrderEvent::Archived => {}
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        let created = self.title.is_some();
        match command {
            OrderCommand::Create { .. } if created => Err(DomainError::conflict("order already exists")),
            OrderCommand::Create { title } => Ok(vec![OrderEvent::Created { title: title.clone() }]),
            _ if !created => Err(DomainError::not_found()),
            OrderCommand::Rename { title } if title.trim().is_empty() => {
                Err(DomainError::validation("title cannot be empty"))
            }
            OrderCommand::Rename { title } => Ok(vec![OrderEvent::Renamed { title: title.clone() }]),
            OrderCommand::Close if !self.open => Ok(vec![]),
            OrderCommand::Close => Ok(vec![OrderEvent::Closed]),
            OrderCommand::Archive => Ok(vec![OrderEvent::Archived]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderCreated {
    pub title: String,
}

impl AggregateEvent for OrderCreated {
    type Aggregate = Order;
    const EVENT_TYPE: &'static str = "order.created";

    fn from_event(event: OrderEvent) -> Option<Self> {
        match event {
            OrderEvent::Created { title } => Some(Self { title }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRenamed {
    pub title: String,
}

impl AggregateEvent for OrderRenamed {
    type Aggregate = Order;
    const EVENT_TYPE: &'static str = "order.renamed";

    fn from_event(event: OrderEvent) -> Option<Self> {
        match event {
            OrderEvent::Renamed { title } => Some(Self { title }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderClosed;

impl AggregateEvent for OrderClosed {
    type Aggregate = Order;
    const EVENT_TYPE: &'static str = "order.closed";

    fn from_event(event: OrderEvent) -> Option<Self> {
        matches!(event, OrderEvent::Closed).then_some(OrderClosed)
    }
}

/// Envelope for an `Order` event, as the repository would publish it.
pub fn order_envelope(aggregate_id: AggregateId, version: i64, event: OrderEvent) -> AggregateDomainEventMessage {
    let domain_event = DomainEvent {
        id: Uuid::now_v7(),
        aggregate_id,
        version,
        time_stamp_utc: Utc::now(),
        user_id: None,
        payload: event,
    };
    AggregateDomainEventMessage::from_domain_event::<Order>(&domain_event, MessageState::new())
        .expect("order events serialize")
}

/// Projects `Order` events onto `OrderView` rows keyed by aggregate id.
#[derive(Debug, Default)]
pub struct OrderViewProjection;

#[async_trait::async_trait]
impl ReadModelProjection for OrderViewProjection {
    type Entity = OrderView;

    fn create_entity(&self, id: &str, _event: &AggregateDomainEventMessage) -> OrderView {
        order_view(id, "", true)
    }

    async fn handle(
        &self,
        projector: &ReadModelProjector<Self>,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) -> Result<(), ProjectionError> {
        if !event.is_aggregate::<Order>() {
            return Ok(());
        }
        match event.event::<Order>()? {
            OrderEvent::Created { title } => {
                projector
                    .load_and_save_every_time(
                        event,
                        move |view| {
                            view.title = title;
                            view.open = true;
                        },
                        cancel,
                    )
                    .await?;
            }
            OrderEvent::Renamed { title } => {
                projector
                    .load_and_save_only_existing(event, move |view| view.title = title, cancel)
                    .await?;
            }
            OrderEvent::Closed => {
                projector
                    .load_and_save_only_existing(event, |view| view.open = false, cancel)
                    .await?;
            }
            OrderEvent::Archived => {
                projector.delete_item_if(event, |view| !view.open, cancel).await?;
            }
        }
        Ok(())
    }
}
