//! Cache-aside adapter.
//!
//! ## Read paths
//!
//! - [`CacheAdapter::cache_load`] / [`CacheAdapter::cache_load_items`]: memoize the
//!   result of an arbitrary loader under one key.
//! - [`CacheAdapter::load_set_items`]: query caching for read entities. A set key holds
//!   the ids matched by a query; each entity is cached on its own under
//!   `"{EntityType}-{id}"`. A query with no results stores [`EMPTY_SET_MARKER`] so
//!   "queried, nothing found" stays distinguishable from "never queried".
//!
//! ## Crowd-collapsing
//!
//! Set population runs under a lock named after the set key and re-checks the key
//! once inside, so concurrent identical queries execute the backing query once.
//!
//! ## Failure policy
//!
//! Caching is best effort: cache store failures count as misses, loader failures are
//! logged and replaced by an empty result unless `throw_exceptions` is set.
//! Cancellation always surfaces as [`CacheError::Cancelled`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use eventline_core::{Entity, entity_cache_key};

use super::store::{CacheStore, CacheStoreError};
use crate::config::{CacheOptions, LockOptions};
use crate::lock::{LockError, LockProvider, try_using, wait_for_release};
use crate::read_model::{EntityStore, EntityStoreError, EntityStoreExt};

/// Member stored in a set key whose query matched nothing.
pub const EMPTY_SET_MARKER: &str = "EMPTY-0001111";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] CacheStoreError),

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Entities(EntityStoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("loader failed: {0:#}")]
    Loader(anyhow::Error),
}

impl From<LockError> for CacheError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Cancelled => CacheError::Cancelled,
            other => CacheError::Lock(other),
        }
    }
}

impl From<EntityStoreError> for CacheError {
    fn from(value: EntityStoreError) -> Self {
        match value {
            EntityStoreError::Cancelled => CacheError::Cancelled,
            other => CacheError::Entities(other),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

pub struct CacheAdapter {
    store: Arc<dyn CacheStore>,
    locks: Arc<dyn LockProvider>,
    entities: Arc<dyn EntityStore>,
    options: CacheOptions,
    lock_options: LockOptions,
}

impl std::fmt::Debug for CacheAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAdapter")
            .field("options", &self.options)
            .field("lock_options", &self.lock_options)
            .finish_non_exhaustive()
    }
}

impl CacheAdapter {
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: Arc<dyn LockProvider>,
        entities: Arc<dyn EntityStore>,
        options: CacheOptions,
        lock_options: LockOptions,
    ) -> Self {
        Self {
            store,
            locks,
            entities,
            options,
            lock_options,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }

    fn ttl_or_default(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.options.default_ttl)
    }

    /// Apply the failure policy: log, then rethrow only under `throw_exceptions`.
    fn recover<T>(&self, op: &'static str, key: &str, err: CacheError, fallback: T) -> Result<T, CacheError> {
        if matches!(err, CacheError::Cancelled) {
            return Err(err);
        }
        warn!(op, cache_key = key, error = %err, "cache operation failed");
        if self.options.throw_exceptions {
            Err(err)
        } else {
            Ok(fallback)
        }
    }

    async fn read_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(json)) => match serde_json::from_value(json) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(cache_key = key, error = %e, "cached value does not decode; treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(cache_key = key, error = %e, "cache read failed; treating as miss");
                None
            }
        }
    }

    async fn key_exists(&self, key: &str) -> bool {
        self.store.exists(key).await.unwrap_or_else(|e| {
            warn!(cache_key = key, error = %e, "cache exists check failed; treating as missing");
            false
        })
    }

    /// Store a loaded value unless a concurrent loader currently owns the key.
    async fn write_value(&self, key: &str, json: JsonValue, ttl: Duration, cancel: &CancellationToken) {
        if self.options.disable_value_locking {
            if let Err(e) = self.store.set(key, json, Some(ttl)).await {
                warn!(cache_key = key, error = %e, "cache write failed");
            }
            return;
        }

        match self.locks.is_locked(key).await {
            Ok(true) => {
                debug!(cache_key = key, "key is being loaded elsewhere; skipping write");
            }
            Ok(false) => {
                let store = &self.store;
                let written = try_using(
                    &*self.locks,
                    key,
                    self.lock_options.default_ttl,
                    self.options.lock_timeout,
                    cancel,
                    move || store.set(key, json, Some(ttl)),
                )
                .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(cache_key = key, error = %e, "cache write failed"),
                    Err(e) => warn!(cache_key = key, error = %e, "cache write skipped"),
                }
            }
            Err(e) => warn!(cache_key = key, error = %e, "lock check failed; skipping write"),
        }
    }

    async fn cache_entity<T: Entity>(&self, entity: &T, ttl: Duration) {
        let key = entity_cache_key::<T>(entity.entity_id());
        match serde_json::to_value(entity) {
            Ok(json) => {
                if let Err(e) = self.store.set(&key, json, Some(ttl)).await {
                    warn!(cache_key = %key, error = %e, "failed to cache entity");
                }
            }
            Err(e) => warn!(cache_key = %key, error = %e, "failed to serialize entity"),
        }
    }

    /// Memoize a single value.
    ///
    /// On a hit the cached value is returned (its TTL optionally refreshed); on a miss
    /// `loader` runs and a `Some` result is stored for `ttl` (default TTL when `None`).
    #[instrument(skip_all, fields(cache_key = %key))]
    pub async fn cache_load<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        refresh_ttl_on_hit: bool,
        cancel: &CancellationToken,
        loader: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let started = Instant::now();
        debug!("cache load started");

        if self.options.caching_disabled {
            return match loader().await {
                Ok(value) => Ok(value),
                Err(e) => self.recover("cache_load", key, CacheError::Loader(e), None),
            };
        }

        let ttl = self.ttl_or_default(ttl);
        if let Some(hit) = self.read_value::<T>(key).await {
            if refresh_ttl_on_hit {
                if let Err(e) = self.store.set_expiration(key, ttl).await {
                    warn!(error = %e, "failed to refresh ttl");
                }
            }
            debug!(hit = true, elapsed_ms = elapsed_ms(started), "cache load finished");
            return Ok(Some(hit));
        }

        let value = match loader().await {
            Ok(value) => value,
            Err(e) => return self.recover("cache_load", key, CacheError::Loader(e), None),
        };
        if let Some(value) = &value {
            match serde_json::to_value(value) {
                Ok(json) => self.write_value(key, json, ttl, cancel).await,
                Err(e) => warn!(error = %e, "loaded value does not serialize; not cached"),
            }
        }

        debug!(hit = false, elapsed_ms = elapsed_ms(started), "cache load finished");
        Ok(value)
    }

    /// Memoize a list; an empty list is cached too.
    #[instrument(skip_all, fields(cache_key = %key))]
    pub async fn cache_load_items<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        refresh_ttl_on_hit: bool,
        cancel: &CancellationToken,
        loader: F,
    ) -> Result<Vec<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<Vec<T>>> + Send,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let started = Instant::now();
        debug!("cache load items started");

        if self.options.caching_disabled {
            return match loader().await {
                Ok(items) => Ok(items),
                Err(e) => self.recover("cache_load_items", key, CacheError::Loader(e), Vec::new()),
            };
        }

        let ttl = self.ttl_or_default(ttl);
        if let Some(hit) = self.read_value::<Vec<T>>(key).await {
            if refresh_ttl_on_hit {
                if let Err(e) = self.store.set_expiration(key, ttl).await {
                    warn!(error = %e, "failed to refresh ttl");
                }
            }
            debug!(hit = true, count = hit.len(), elapsed_ms = elapsed_ms(started), "cache load items finished");
            return Ok(hit);
        }

        let items = match loader().await {
            Ok(items) => items,
            Err(e) => return self.recover("cache_load_items", key, CacheError::Loader(e), Vec::new()),
        };
        match serde_json::to_value(&items) {
            Ok(json) => self.write_value(key, json, ttl, cancel).await,
            Err(e) => warn!(error = %e, "loaded items do not serialize; not cached"),
        }

        debug!(hit = false, count = items.len(), elapsed_ms = elapsed_ms(started), "cache load items finished");
        Ok(items)
    }

    /// Query caching: resolve `set_key` to entities, populating it from the entity store on first use.
    ///
    /// Members whose own cache entry was evicted are reloaded by id in chunks of
    /// `load_split_size`, so partial eviction never forces a full re-query.
    #[instrument(skip_all, fields(set_key = %set_key, entity_type = T::ENTITY_TYPE))]
    pub async fn load_set_items<T, P>(
        &self,
        set_key: &str,
        predicate: P,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, CacheError>
    where
        T: Entity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let started = Instant::now();
        debug!("load set items started");

        if self.options.caching_disabled {
            return match self.entities.load_items::<T, _>(&predicate, cancel).await {
                Ok(items) => Ok(items),
                Err(e) => self.recover("load_set_items", set_key, e.into(), Vec::new()),
            };
        }

        let ttl = self.ttl_or_default(ttl);

        if !self.options.disable_locking {
            match self.locks.is_locked(set_key).await {
                Ok(true) => {
                    debug!("set is being populated elsewhere; waiting");
                    match wait_for_release(&*self.locks, set_key, self.options.lock_timeout, cancel).await {
                        Ok(()) => {}
                        Err(LockError::Cancelled) => return Err(CacheError::Cancelled),
                        Err(e) => warn!(error = %e, "gave up waiting for set population"),
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "lock check failed"),
            }
        }

        if !self.key_exists(set_key).await {
            if self.options.disable_locking {
                return self
                    .load_list_and_add_set_to_cache(set_key, &predicate, Some(ttl), cancel)
                    .await;
            }

            let predicate_ref = &predicate;
            let populated = try_using(
                &*self.locks,
                set_key,
                self.lock_options.default_ttl,
                self.options.lock_timeout,
                cancel,
                move || async move {
                    // Another caller may have populated the set while we waited for the lock.
                    if self.key_exists(set_key).await {
                        return Ok(None);
                    }
                    self.load_list_and_add_set_to_cache(set_key, predicate_ref, Some(ttl), cancel)
                        .await
                        .map(Some)
                },
            )
            .await;

            match populated {
                Ok(Ok(Some(items))) => {
                    debug!(count = items.len(), elapsed_ms = elapsed_ms(started), "load set items finished");
                    return Ok(items);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => return Err(e),
                Err(LockError::Cancelled) => return Err(CacheError::Cancelled),
                Err(e) => {
                    // Serve the query uncached rather than fail the read.
                    warn!(error = %e, "could not lock set for population; querying directly");
                    return match self.entities.load_items::<T, _>(&predicate, cancel).await {
                        Ok(items) => Ok(items),
                        Err(e) => self.recover("load_set_items", set_key, e.into(), Vec::new()),
                    };
                }
            }
        }

        let items = self.read_set_members::<T, _>(set_key, &predicate, ttl, cancel).await?;
        debug!(count = items.len(), elapsed_ms = elapsed_ms(started), "load set items finished");
        Ok(items)
    }

    async fn read_set_members<T, P>(
        &self,
        set_key: &str,
        predicate: &P,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, CacheError>
    where
        T: Entity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let members = match self.store.get_set(set_key).await {
            Ok(Some(members)) => members,
            Ok(None) => {
                debug!("set vanished before it could be read; repopulating");
                return self
                    .load_list_and_add_set_to_cache(set_key, predicate, Some(ttl), cancel)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "set read failed; querying directly");
                return match self.entities.load_items::<T, _>(predicate, cancel).await {
                    Ok(items) => Ok(items),
                    Err(e) => self.recover("load_set_items", set_key, e.into(), Vec::new()),
                };
            }
        };

        let ids: Vec<String> = members.into_iter().filter(|m| m != EMPTY_SET_MARKER).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| entity_cache_key::<T>(id)).collect();
        let cached = self.store.get_all(&keys).await.unwrap_or_else(|e| {
            warn!(error = %e, "bulk cache read failed; reloading all members");
            HashMap::new()
        });

        let mut by_id: HashMap<String, T> = HashMap::with_capacity(ids.len());
        for (id, key) in ids.iter().zip(&keys) {
            if let Some(json) = cached.get(key) {
                if let Ok(entity) = serde_json::from_value::<T>(json.clone()) {
                    by_id.insert(id.clone(), entity);
                }
            }
        }

        let missing: Vec<String> = ids.iter().filter(|id| !by_id.contains_key(*id)).cloned().collect();
        if !missing.is_empty() {
            debug!(missing = missing.len(), "reloading evicted set members");
            for chunk in missing.chunks(self.options.load_split_size.max(1)) {
                match self.entities.load_items_by_ids::<T>(chunk, cancel).await {
                    Ok(loaded) => {
                        for entity in loaded {
                            self.cache_entity(&entity, ttl).await;
                            by_id.insert(entity.entity_id().to_string(), entity);
                        }
                    }
                    Err(e) => {
                        self.recover("load_set_items", set_key, e.into(), ())?;
                    }
                }
            }
        }

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Run the backing query, cache every entity and register the ids under `set_key`.
    #[instrument(skip_all, fields(set_key = %set_key, entity_type = T::ENTITY_TYPE))]
    pub async fn load_list_and_add_set_to_cache<T, P>(
        &self,
        set_key: &str,
        predicate: &P,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, CacheError>
    where
        T: Entity,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let started = Instant::now();
        debug!("set population started");

        let items = match self.entities.load_items::<T, _>(predicate, cancel).await {
            Ok(items) => items,
            Err(e) => return self.recover("load_list_and_add_set_to_cache", set_key, e.into(), Vec::new()),
        };

        let ttl = self.ttl_or_default(ttl);
        for item in &items {
            self.cache_entity(item, ttl).await;
        }

        let members: Vec<String> = if items.is_empty() {
            vec![EMPTY_SET_MARKER.to_string()]
        } else {
            items.iter().map(|item| item.entity_id().to_string()).collect()
        };
        if let Err(e) = self.store.set_add(set_key, &members, Some(ttl)).await {
            warn!(error = %e, "failed to register set members");
        }

        debug!(count = items.len(), elapsed_ms = elapsed_ms(started), "set population finished");
        Ok(items)
    }

    /// Add `id` to an existing set (no-op when the set was never populated).
    pub async fn set_items_ensure(&self, set_key: &str, id: &str, cancel: &CancellationToken) -> Result<(), CacheError> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if self.options.caching_disabled {
            return Ok(());
        }

        let store = &self.store;
        self.with_secondary_lock("set_items_ensure", set_key, cancel, move || async move {
            if !store.exists(set_key).await? {
                return Ok(());
            }
            store.set_add(set_key, &[id.to_string()], None).await?;
            store.set_remove(set_key, &[EMPTY_SET_MARKER.to_string()]).await?;
            Ok::<(), CacheStoreError>(())
        })
        .await
    }

    /// Remove `id` from an existing set; a set losing its last id falls back to the empty marker.
    pub async fn set_items_ensure_not(
        &self,
        set_key: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CacheError> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if self.options.caching_disabled {
            return Ok(());
        }

        let store = &self.store;
        self.with_secondary_lock("set_items_ensure_not", set_key, cancel, move || async move {
            let Some(members) = store.get_set(set_key).await? else {
                return Ok(());
            };
            if !members.iter().any(|m| m == id) {
                return Ok(());
            }
            if members.len() == 1 {
                store.set_add(set_key, &[EMPTY_SET_MARKER.to_string()], None).await?;
            }
            store.set_remove(set_key, &[id.to_string()]).await?;
            Ok::<(), CacheStoreError>(())
        })
        .await
    }

    async fn with_secondary_lock<F, Fut>(
        &self,
        op: &'static str,
        set_key: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<(), CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CacheStoreError>>,
    {
        let outcome: Result<(), CacheError> = if self.options.disable_secondary_locking {
            body().await.map_err(CacheError::from)
        } else {
            let lock_id = format!("{set_key}.ItemsAdd");
            match try_using(
                &*self.locks,
                &lock_id,
                self.lock_options.default_ttl,
                self.lock_options.set_items_timeout,
                cancel,
                body,
            )
            .await
            {
                Ok(result) => result.map_err(CacheError::from),
                Err(e) => Err(e.into()),
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => self.recover(op, set_key, e, ()),
        }
    }

    /// Invalidate every key starting with `prefix`; returns how many were removed.
    #[instrument(skip_all, fields(prefix = %prefix))]
    pub async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        if self.options.caching_disabled {
            return Ok(0);
        }
        let started = Instant::now();
        match self.store.remove_by_prefix(prefix).await {
            Ok(removed) => {
                debug!(removed, elapsed_ms = elapsed_ms(started), "cache prefix removed");
                Ok(removed)
            }
            Err(e) => self.recover("remove_by_prefix", prefix, e.into(), 0),
        }
    }

    /// Store `value` under `key` (default TTL when `ttl` is `None`).
    pub async fn add<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.options.caching_disabled {
            return Ok(());
        }
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => return self.recover("add", key, CacheError::Serialization(e.to_string()), ()),
        };
        match self.store.set(key, json, Some(self.ttl_or_default(ttl))).await {
            Ok(()) => Ok(()),
            Err(e) => self.recover("add", key, e.into(), ()),
        }
    }
}
