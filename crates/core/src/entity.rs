//! Read-model entity: identity + type key for caching and locking.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A persisted read-model row.
///
/// `ENTITY_TYPE` is the stable type key shared by cache keys (`"{ENTITY_TYPE}..."`),
/// query cache prefixes and projector lock names (`"CACHE-{ENTITY_TYPE}"`).
pub trait Entity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const ENTITY_TYPE: &'static str;

    /// Returns the entity identifier (unique within `ENTITY_TYPE`).
    fn entity_id(&self) -> &str;
}

/// Cache key under which a single entity value is memoized.
pub fn entity_cache_key<T: Entity>(entity_id: &str) -> String {
    format!("{}-{}", T::ENTITY_TYPE, entity_id)
}
