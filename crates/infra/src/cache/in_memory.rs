use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::Instant;

use super::store::{CacheStore, CacheStoreError};

#[derive(Debug, Clone)]
enum Stored {
    Value(JsonValue),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    stored: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process cache store for tests/dev.
///
/// Expired entries are dropped lazily when touched.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> Result<R, CacheStoreError>,
    ) -> Result<R, CacheStoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheStoreError::Backend("cache table poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_entries(|entries, _| Ok(entries.len())).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn expiry(now: Instant, ttl: Option<Duration>, current: Option<Instant>) -> Option<Instant> {
    match ttl {
        Some(ttl) => Some(now + ttl),
        None => current,
    }
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheStoreError> {
        self.with_entries(|entries, _| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                stored: Stored::Value(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(CacheStoreError::WrongKind(key.to_string())),
        })
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, JsonValue>, CacheStoreError> {
        self.with_entries(|entries, _| {
            Ok(keys
                .iter()
                .filter_map(|key| match entries.get(key) {
                    Some(Entry {
                        stored: Stored::Value(v),
                        ..
                    }) => Some((key.clone(), v.clone())),
                    _ => None,
                })
                .collect())
        })
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        self.with_entries(|entries, now| {
            let current = entries.get(key).and_then(|e| e.expires_at);
            entries.insert(
                key.to_string(),
                Entry {
                    stored: Stored::Value(value),
                    expires_at: expiry(now, ttl, current),
                },
            );
            Ok(())
        })
    }

    async fn add(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<bool, CacheStoreError> {
        self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    stored: Stored::Value(value),
                    expires_at: expiry(now, ttl, None),
                },
            );
            Ok(true)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.with_entries(|entries, _| Ok(entries.contains_key(key)))
    }

    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheStoreError> {
        self.with_entries(|entries, _| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                stored: Stored::Set(members),
                ..
            }) => Ok(Some(members.iter().cloned().collect())),
            Some(_) => Err(CacheStoreError::WrongKind(key.to_string())),
        })
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        self.with_entries(|entries, now| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                stored: Stored::Set(BTreeSet::new()),
                expires_at: None,
            });
            let Stored::Set(set) = &mut entry.stored else {
                return Err(CacheStoreError::WrongKind(key.to_string()));
            };
            set.extend(members.iter().cloned());
            entry.expires_at = expiry(now, ttl, entry.expires_at);
            Ok(())
        })
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), CacheStoreError> {
        self.with_entries(|entries, _| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(());
            };
            let Stored::Set(set) = &mut entry.stored else {
                return Err(CacheStoreError::WrongKind(key.to_string()));
            };
            for member in members {
                set.remove(member);
            }
            if set.is_empty() {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.with_entries(|entries, _| Ok(entries.remove(key).is_some()))
    }

    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
        self.with_entries(|entries, _| {
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            Ok(before - entries.len())
        })
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), CacheStoreError> {
        self.with_entries(|entries, now| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
            Ok(())
        })
    }
}
