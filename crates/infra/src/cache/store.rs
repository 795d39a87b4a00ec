use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key '{0}' holds a value of the wrong kind")]
    WrongKind(String),
}

/// Shared key/value cache with member sets.
///
/// Keys hold either a JSON value or a set of string members. A `ttl` of `None`
/// keeps an existing expiry (or none for a new key).
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheStoreError>;

    /// Values for the keys that are present; missing keys are omitted.
    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, JsonValue>, CacheStoreError>;

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), CacheStoreError>;

    /// Store only if `key` is absent; returns whether the value was written.
    async fn add(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<bool, CacheStoreError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheStoreError>;

    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheStoreError>;

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<(), CacheStoreError>;

    /// Remove members; a set left without members disappears.
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), CacheStoreError>;

    async fn remove(&self, key: &str) -> Result<bool, CacheStoreError>;

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError>;

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), CacheStoreError>;
}

#[async_trait::async_trait]
impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheStoreError> {
        (**self).get(key).await
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, JsonValue>, CacheStoreError> {
        (**self).get_all(keys).await
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        (**self).set(key, value, ttl).await
    }

    async fn add(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<bool, CacheStoreError> {
        (**self).add(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        (**self).exists(key).await
    }

    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheStoreError> {
        (**self).get_set(key).await
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        (**self).set_add(key, members, ttl).await
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), CacheStoreError> {
        (**self).set_remove(key, members).await
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        (**self).remove(key).await
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
        (**self).remove_by_prefix(prefix).await
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), CacheStoreError> {
        (**self).set_expiration(key, ttl).await
    }
}
