use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use eventline_core::Entity;

/// Row filter evaluated against the stored JSON representation.
pub type JsonPredicate<'a> = &'a (dyn Fn(&JsonValue) -> bool + Send + Sync);

#[derive(Debug, Error)]
pub enum EntityStoreError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("entity not found: {entity_type}/{id}")]
    NotFound { entity_type: String, id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("entity store backend error: {0}")]
    Backend(String),
}

/// Key/value storage for disposable read-model rows, partitioned by entity type.
///
/// Rows are addressed by `(entity_type, id)`. `put` is an upsert, so re-projecting
/// the same event never duplicates a row.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, EntityStoreError>;

    async fn query(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError>;

    /// Rows for the given ids; ids without a row are skipped.
    async fn get_many(
        &self,
        entity_type: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError>;

    async fn put(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError>;

    /// Overwrite an existing row; fails with `NotFound` when there is none.
    async fn replace(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError>;

    async fn put_many(
        &self,
        entity_type: &str,
        rows: Vec<(String, JsonValue)>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError>;

    /// Returns whether a row was removed.
    async fn remove(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EntityStoreError>;

    async fn remove_where(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError>;

    /// Drop every row of `entity_type` (rebuild support).
    async fn clear(&self, entity_type: &str, cancel: &CancellationToken) -> Result<usize, EntityStoreError>;
}

#[async_trait::async_trait]
impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    async fn get(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, EntityStoreError> {
        (**self).get(entity_type, id, cancel).await
    }

    async fn query(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        (**self).query(entity_type, predicate, cancel).await
    }

    async fn get_many(
        &self,
        entity_type: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        (**self).get_many(entity_type, ids, cancel).await
    }

    async fn put(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        (**self).put(entity_type, id, value, cancel).await
    }

    async fn replace(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        (**self).replace(entity_type, id, value, cancel).await
    }

    async fn put_many(
        &self,
        entity_type: &str,
        rows: Vec<(String, JsonValue)>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        (**self).put_many(entity_type, rows, cancel).await
    }

    async fn remove(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EntityStoreError> {
        (**self).remove(entity_type, id, cancel).await
    }

    async fn remove_where(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        (**self).remove_where(entity_type, predicate, cancel).await
    }

    async fn clear(&self, entity_type: &str, cancel: &CancellationToken) -> Result<usize, EntityStoreError> {
        (**self).clear(entity_type, cancel).await
    }
}

fn check_key(id: &str) -> Result<(), EntityStoreError> {
    if id.trim().is_empty() {
        return Err(EntityStoreError::InvalidKey("entity id must not be empty".to_string()));
    }
    Ok(())
}

fn to_json<T: Entity>(entity: &T) -> Result<JsonValue, EntityStoreError> {
    serde_json::to_value(entity).map_err(|e| EntityStoreError::Serialization(e.to_string()))
}

fn from_json<T: Entity>(value: JsonValue) -> Result<T, EntityStoreError> {
    serde_json::from_value(value).map_err(|e| EntityStoreError::Serialization(e.to_string()))
}

fn from_json_rows<T: Entity>(rows: Vec<JsonValue>) -> Result<Vec<T>, EntityStoreError> {
    rows.into_iter().map(from_json).collect()
}

/// Typed read-model operations for [`Entity`] types, available on every [`EntityStore`].
#[async_trait::async_trait]
pub trait EntityStoreExt: EntityStore {
    async fn load_item<T: Entity>(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, EntityStoreError> {
        check_key(id)?;
        self.get(T::ENTITY_TYPE, id, cancel).await?.map(from_json::<T>).transpose()
    }

    async fn load_items<T, P>(&self, predicate: P, cancel: &CancellationToken) -> Result<Vec<T>, EntityStoreError>
    where
        T: Entity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let matches = move |value: &JsonValue| {
            serde_json::from_value::<T>(value.clone())
                .map(|entity| predicate(&entity))
                .unwrap_or(false)
        };
        let rows = self.query(T::ENTITY_TYPE, &matches, cancel).await?;
        from_json_rows(rows)
    }

    async fn load_items_by_ids<T: Entity>(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, EntityStoreError> {
        for id in ids {
            check_key(id)?;
        }
        let rows = self.get_many(T::ENTITY_TYPE, ids, cancel).await?;
        from_json_rows(rows)
    }

    /// Upsert: an existing row with the same id is overwritten.
    async fn insert_item<T: Entity>(&self, entity: &T, cancel: &CancellationToken) -> Result<(), EntityStoreError> {
        check_key(entity.entity_id())?;
        self.put(T::ENTITY_TYPE, entity.entity_id(), to_json(entity)?, cancel).await
    }

    async fn update_item<T: Entity>(&self, entity: &T, cancel: &CancellationToken) -> Result<(), EntityStoreError> {
        check_key(entity.entity_id())?;
        self.replace(T::ENTITY_TYPE, entity.entity_id(), to_json(entity)?, cancel)
            .await
    }

    async fn bulk_insert_items<T: Entity>(
        &self,
        entities: &[T],
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities {
            check_key(entity.entity_id())?;
            rows.push((entity.entity_id().to_string(), to_json(entity)?));
        }
        self.put_many(T::ENTITY_TYPE, rows, cancel).await
    }

    async fn delete_item<T: Entity>(&self, id: &str, cancel: &CancellationToken) -> Result<bool, EntityStoreError> {
        check_key(id)?;
        self.remove(T::ENTITY_TYPE, id, cancel).await
    }

    async fn delete_items<T, P>(&self, predicate: P, cancel: &CancellationToken) -> Result<usize, EntityStoreError>
    where
        T: Entity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let matches = move |value: &JsonValue| {
            serde_json::from_value::<T>(value.clone())
                .map(|entity| predicate(&entity))
                .unwrap_or(false)
        };
        self.remove_where(T::ENTITY_TYPE, &matches, cancel).await
    }

    async fn delete_all_items<T: Entity>(&self, cancel: &CancellationToken) -> Result<usize, EntityStoreError> {
        self.clear(T::ENTITY_TYPE, cancel).await
    }
}

impl<S> EntityStoreExt for S where S: EntityStore + ?Sized {}

/// In-memory entity store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    inner: RwLock<HashMap<String, BTreeMap<String, JsonValue>>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(cancel: &CancellationToken) -> Result<(), EntityStoreError> {
        if cancel.is_cancelled() {
            return Err(EntityStoreError::Cancelled);
        }
        Ok(())
    }

    fn poisoned() -> EntityStoreError {
        EntityStoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JsonValue>, EntityStoreError> {
        Self::guard(cancel)?;
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(entity_type).and_then(|rows| rows.get(id)).cloned())
    }

    async fn query(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        Self::guard(cancel)?;
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map
            .get(entity_type)
            .map(|rows| rows.values().filter(|v| predicate(v)).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_many(
        &self,
        entity_type: &str,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<JsonValue>, EntityStoreError> {
        Self::guard(cancel)?;
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        let Some(rows) = map.get(entity_type) else {
            return Ok(vec![]);
        };
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn put(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        Self::guard(cancel)?;
        check_key(id)?;
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        map.entry(entity_type.to_string())
            .or_default()
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn replace(
        &self,
        entity_type: &str,
        id: &str,
        value: JsonValue,
        cancel: &CancellationToken,
    ) -> Result<(), EntityStoreError> {
        Self::guard(cancel)?;
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        match map.get_mut(entity_type).and_then(|rows| rows.get_mut(id)) {
            Some(row) => {
                *row = value;
                Ok(())
            }
            None => Err(EntityStoreError::NotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn put_many(
        &self,
        entity_type: &str,
        rows: Vec<(String, JsonValue)>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        Self::guard(cancel)?;
        for (id, _) in &rows {
            check_key(id)?;
        }
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let table = map.entry(entity_type.to_string()).or_default();
        let count = rows.len();
        table.extend(rows);
        Ok(count)
    }

    async fn remove(
        &self,
        entity_type: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, EntityStoreError> {
        Self::guard(cancel)?;
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map
            .get_mut(entity_type)
            .is_some_and(|rows| rows.remove(id).is_some()))
    }

    async fn remove_where(
        &self,
        entity_type: &str,
        predicate: JsonPredicate<'_>,
        cancel: &CancellationToken,
    ) -> Result<usize, EntityStoreError> {
        Self::guard(cancel)?;
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let Some(rows) = map.get_mut(entity_type) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_id, v| !predicate(v));
        Ok(before - rows.len())
    }

    async fn clear(&self, entity_type: &str, cancel: &CancellationToken) -> Result<usize, EntityStoreError> {
        Self::guard(cancel)?;
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map.remove(entity_type).map(|rows| rows.len()).unwrap_or(0))
    }
}
