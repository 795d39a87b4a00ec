//! Read-model projector: applies domain events to cached read entities.
//!
//! ## Per-event state machine
//!
//! ```text
//! lock "{EntityType}-{create_lock_id(event)}"
//!   ↓ load   -> EntityDescriptor { is_new }
//!   ↓ decide -> delete-if | delete | upsert every time | upsert only existing
//!   ↓ lock "CACHE-{EntityType}"
//!       ↓ write entity store
//!       ↓ remove_by_prefix(EntityType)   (all query caches of the type)
//!   ↓ live mode only: EntityChangedNotification
//! ```
//!
//! Errors inside either lock propagate to the caller after the lock is released.
//! Unlike the cache read path, the projector never swallows its own failures.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use eventline_core::Entity;
use eventline_events::{AggregateDomainEventMessage, EntityChange, EntityChangedNotification, TransportError};

use super::context::{EntityDescriptor, ProjectionContext};
use crate::cache::{CacheAdapter, CacheError};
use crate::lock::{LockError, try_using};
use crate::messaging::{LockScope, MessageBusAdapter};
use crate::read_model::{EntityStoreError, EntityStoreExt};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Entities(EntityStoreError),

    #[error(transparent)]
    Cache(CacheError),

    #[error("failed to decode domain event: {0}")]
    Deserialize(String),
}

impl From<LockError> for ProjectionError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Cancelled => ProjectionError::Cancelled,
            other => ProjectionError::Lock(other),
        }
    }
}

impl From<EntityStoreError> for ProjectionError {
    fn from(value: EntityStoreError) -> Self {
        match value {
            EntityStoreError::Cancelled => ProjectionError::Cancelled,
            other => ProjectionError::Entities(other),
        }
    }
}

impl From<CacheError> for ProjectionError {
    fn from(value: CacheError) -> Self {
        match value {
            CacheError::Cancelled => ProjectionError::Cancelled,
            other => ProjectionError::Cache(other),
        }
    }
}

impl From<serde_json::Error> for ProjectionError {
    fn from(value: serde_json::Error) -> Self {
        ProjectionError::Deserialize(value.to_string())
    }
}

/// One read model fed by domain events.
///
/// Implementations pick the events they care about in [`handle`](Self::handle)
/// and call one of the projector's load/decide/save helpers for each.
#[async_trait::async_trait]
pub trait ReadModelProjection: Send + Sync + Sized + 'static {
    type Entity: Entity;

    /// Logical key serializing updates caused by `event` (default: the aggregate id).
    fn create_lock_id(&self, event: &AggregateDomainEventMessage) -> String {
        event.aggregate_id().to_string()
    }

    /// Id of the read entity `event` touches (default: the aggregate id).
    fn entity_id(&self, event: &AggregateDomainEventMessage) -> String {
        event.aggregate_id().to_string()
    }

    /// Initial value for an entity that does not exist yet.
    fn create_entity(&self, id: &str, event: &AggregateDomainEventMessage) -> Self::Entity;

    /// Payload clients need to refresh the entity after a live change.
    fn create_identifier_item(&self, entity: &Self::Entity) -> JsonValue {
        json!({ "id": entity.entity_id() })
    }

    async fn handle(
        &self,
        projector: &ReadModelProjector<Self>,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) -> Result<(), ProjectionError>;
}

pub struct ReadModelProjector<P: ReadModelProjection> {
    projection: P,
    cache: Arc<CacheAdapter>,
    bus: Arc<MessageBusAdapter>,
    context: ProjectionContext,
}

impl<P: ReadModelProjection + std::fmt::Debug> std::fmt::Debug for ReadModelProjector<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadModelProjector")
            .field("projection", &self.projection)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<P: ReadModelProjection> ReadModelProjector<P> {
    pub fn new(projection: P, cache: Arc<CacheAdapter>, bus: Arc<MessageBusAdapter>) -> Self {
        Self {
            projection,
            cache,
            bus,
            context: ProjectionContext::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn context(&self) -> &ProjectionContext {
        &self.context
    }

    fn entity_type(&self) -> &'static str {
        <P::Entity as Entity>::ENTITY_TYPE
    }

    /// Load the entity `event` touches, or create it (`is_new = true`) when absent.
    pub async fn load_item(
        &self,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) -> Result<EntityDescriptor<P::Entity>, ProjectionError> {
        let id = self.projection.entity_id(event);
        match self.cache.entities().load_item::<P::Entity>(&id, cancel).await? {
            Some(entity) => Ok(EntityDescriptor::existing(id, entity)),
            None => {
                let entity = self.projection.create_entity(&id, event);
                Ok(EntityDescriptor::created(id, entity))
            }
        }
    }

    /// Apply `mutate` and save, whether or not the entity existed before.
    pub async fn load_and_save_every_time<F>(
        &self,
        event: &AggregateDomainEventMessage,
        mutate: F,
        cancel: &CancellationToken,
    ) -> Result<EntityDescriptor<P::Entity>, ProjectionError>
    where
        F: FnOnce(&mut P::Entity) + Send,
    {
        self.with_entity_lock(event, cancel, move || async move {
            let mut descriptor = self.load_item(event, cancel).await?;
            mutate(&mut descriptor.entity);
            let change = if descriptor.is_new {
                EntityChange::Inserted
            } else {
                EntityChange::Updated
            };
            self.persist(&descriptor, change, cancel).await?;
            self.notify(&descriptor, change, event, cancel).await;
            Ok::<_, ProjectionError>(descriptor)
        })
        .await
    }

    /// Apply `mutate` and save only when the entity already exists; `None` when skipped.
    pub async fn load_and_save_only_existing<F>(
        &self,
        event: &AggregateDomainEventMessage,
        mutate: F,
        cancel: &CancellationToken,
    ) -> Result<Option<EntityDescriptor<P::Entity>>, ProjectionError>
    where
        F: FnOnce(&mut P::Entity) + Send,
    {
        self.with_entity_lock(event, cancel, move || async move {
            let mut descriptor = self.load_item(event, cancel).await?;
            if descriptor.is_new {
                debug!(entity_id = %descriptor.id, "entity does not exist; update skipped");
                return Ok(None);
            }
            mutate(&mut descriptor.entity);
            self.persist(&descriptor, EntityChange::Updated, cancel).await?;
            self.notify(&descriptor, EntityChange::Updated, event, cancel).await;
            Ok::<_, ProjectionError>(Some(descriptor))
        })
        .await
    }

    /// Delete the entity if it exists. Returns whether a row was deleted.
    pub async fn delete_item(
        &self,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, ProjectionError> {
        self.delete_item_if(event, |_| true, cancel).await
    }

    /// Delete the entity if it exists and `predicate` holds for its current value.
    pub async fn delete_item_if<F>(
        &self,
        event: &AggregateDomainEventMessage,
        predicate: F,
        cancel: &CancellationToken,
    ) -> Result<bool, ProjectionError>
    where
        F: FnOnce(&P::Entity) -> bool + Send,
    {
        self.with_entity_lock(event, cancel, move || async move {
            let descriptor = self.load_item(event, cancel).await?;
            if descriptor.is_new || !predicate(&descriptor.entity) {
                return Ok(false);
            }
            self.persist(&descriptor, EntityChange::Deleted, cancel).await?;
            self.notify(&descriptor, EntityChange::Deleted, event, cancel).await;
            Ok::<_, ProjectionError>(true)
        })
        .await
    }

    async fn with_entity_lock<R, F, Fut>(
        &self,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<R, ProjectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ProjectionError>>,
    {
        let lock_id = format!("{}-{}", self.entity_type(), self.projection.create_lock_id(event));
        let options = self.cache.lock_options();
        try_using(
            &**self.cache.locks(),
            &lock_id,
            options.default_ttl,
            options.acquire_timeout,
            cancel,
            body,
        )
        .await?
    }

    /// Write (or delete) under the entity-type cache lock, then drop every query cache of the type.
    async fn persist(
        &self,
        descriptor: &EntityDescriptor<P::Entity>,
        change: EntityChange,
        cancel: &CancellationToken,
    ) -> Result<(), ProjectionError> {
        let entity_type = self.entity_type();
        if change != EntityChange::Deleted && descriptor.entity.entity_id() != descriptor.id {
            return Err(EntityStoreError::InvalidKey(format!(
                "{entity_type} entity id {:?} does not match projected id {:?}",
                descriptor.entity.entity_id(),
                descriptor.id
            ))
            .into());
        }
        let lock_id = format!("CACHE-{entity_type}");
        let options = self.cache.lock_options();
        let cache = &self.cache;

        try_using(
            &**cache.locks(),
            &lock_id,
            options.default_ttl,
            options.acquire_timeout,
            cancel,
            move || async move {
                let entities = cache.entities();
                match change {
                    EntityChange::Deleted => {
                        entities.delete_item::<P::Entity>(&descriptor.id, cancel).await?;
                    }
                    EntityChange::Inserted | EntityChange::Updated => {
                        entities.insert_item(&descriptor.entity, cancel).await?;
                    }
                }
                let removed = cache.remove_by_prefix(entity_type).await?;
                debug!(entity_id = %descriptor.id, ?change, removed, "read entity written");
                Ok::<(), ProjectionError>(())
            },
        )
        .await?
    }

    async fn notify(
        &self,
        descriptor: &EntityDescriptor<P::Entity>,
        change: EntityChange,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) {
        if !self.context.is_live_processing() {
            return;
        }
        let notification = EntityChangedNotification {
            id: Uuid::now_v7(),
            time_stamp_utc: Utc::now(),
            entity_type: self.entity_type().to_string(),
            entity_id: descriptor.id.clone(),
            change,
            event_id: Some(event.event_id()),
            identifier: self.projection.create_identifier_item(&descriptor.entity),
        };
        self.bus.publish(&notification, None, cancel).await;
    }

    /// Run one envelope through the projection.
    #[instrument(
        skip_all,
        fields(
            event_id = %event.event_id(),
            aggregate_type = %event.aggregate_type(),
            event_type = %event.domain_event_type(),
            live = self.context.is_live_processing(),
        ),
        err
    )]
    pub async fn process_event(
        &self,
        event: &AggregateDomainEventMessage,
        cancel: &CancellationToken,
    ) -> Result<(), ProjectionError> {
        if cancel.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }
        let started = Instant::now();
        debug!("projection started");
        self.projection.handle(self, event, cancel).await?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "projection finished");
        Ok(())
    }

    /// Catch up on historical envelopes without emitting live notifications.
    ///
    /// Live mode is restored afterwards, also when a projection fails. Returns the
    /// number of envelopes processed.
    pub async fn replay(
        &self,
        events: &[AggregateDomainEventMessage],
        cancel: &CancellationToken,
    ) -> Result<usize, ProjectionError> {
        let started = Instant::now();
        self.context.set_live_processing(false);
        let outcome = self.replay_events(events, cancel).await;
        self.context.set_live_processing(true);

        if let Ok(processed) = &outcome {
            info!(
                entity_type = self.entity_type(),
                processed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "projection replay finished"
            );
        }
        outcome
    }

    async fn replay_events(
        &self,
        events: &[AggregateDomainEventMessage],
        cancel: &CancellationToken,
    ) -> Result<usize, ProjectionError> {
        let mut processed = 0;
        for event in events {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }
            self.process_event(event, cancel).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Feed the projector from the domain-event envelope stream until `cancel` fires.
    pub async fn subscribe(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), TransportError> {
        let projector = Arc::clone(self);
        self.bus
            .subscribe_message(
                move |event: AggregateDomainEventMessage, token: CancellationToken| {
                    let projector = projector.clone();
                    async move {
                        projector
                            .process_event(&event, &token)
                            .await
                            .map_err(anyhow::Error::from)
                    }
                },
                LockScope::Unlocked,
                cancel,
            )
            .await
    }
}
