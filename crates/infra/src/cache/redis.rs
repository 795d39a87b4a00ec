//! Redis-backed cache store (optional).
//!
//! Values are stored as JSON strings, member sets as native Redis sets. Prefix
//! removal walks the keyspace with `SCAN` so it never blocks the server.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tracing::instrument;

use super::store::{CacheStore, CacheStoreError};

/// Default namespace for cache keys.
const DEFAULT_KEY_PREFIX: &str = "eventline:cache:";

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

#[derive(Clone)]
pub struct RedisCacheStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCacheStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

fn backend(op: &str) -> impl FnOnce(redis::RedisError) -> CacheStoreError + '_ {
    move |e| CacheStoreError::Backend(format!("{op} failed: {e}"))
}

fn ttl_ms(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl RedisCacheStore {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend("connect"))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend("connect"))?;
        Ok(Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn decode(key: &str, raw: Option<String>) -> Result<Option<JsonValue>, CacheStoreError> {
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| CacheStoreError::Serialization(format!("key '{key}': {e}")))
        })
        .transpose()
    }

    fn encode(value: &JsonValue) -> Result<String, CacheStoreError> {
        serde_json::to_string(value).map_err(|e| CacheStoreError::Serialization(e.to_string()))
    }
}

#[async_trait::async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend("GET"))?;
        Self::decode(key, raw)
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, JsonValue>, CacheStoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let full: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&full)
            .query_async(&mut conn)
            .await
            .map_err(backend("MGET"))?;

        let mut found = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(raw) {
            if let Some(value) = Self::decode(key, value)? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(Self::encode(&value)?);
        match ttl {
            Some(ttl) => cmd.arg("PX").arg(ttl_ms(ttl)),
            None => cmd.arg("KEEPTTL"),
        };
        let _: () = cmd.query_async(&mut conn).await.map_err(backend("SET"))?;
        Ok(())
    }

    async fn add(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<bool, CacheStoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(Self::encode(&value)?).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        let written: Option<String> = cmd.query_async(&mut conn).await.map_err(backend("SET NX"))?;
        Ok(written.is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend("EXISTS"))
    }

    async fn get_set(&self, key: &str) -> Result<Option<Vec<String>>, CacheStoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend("SMEMBERS"))?;
        // Redis drops empty sets, so no members means no key.
        Ok(if members.is_empty() { None } else { Some(members) })
    }

    async fn set_add(&self, key: &str, members: &[String], ttl: Option<Duration>) -> Result<(), CacheStoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let full = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("SADD").arg(&full).arg(members).ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(&full).arg(ttl_ms(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(backend("SADD"))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), CacheStoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("SREM")
            .arg(self.key(key))
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(backend("SREM"))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(backend("DEL"))?;
        Ok(removed > 0)
    }

    #[instrument(skip(self), fields(key_prefix = %self.key_prefix), err)]
    async fn remove_by_prefix(&self, prefix: &str) -> Result<usize, CacheStoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend("SCAN"))?;

            if !keys.is_empty() {
                let deleted: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend("DEL"))?;
                removed += deleted.max(0) as usize;
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }

    async fn set_expiration(&self, key: &str, ttl: Duration) -> Result<(), CacheStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend("PEXPIRE"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("Order.*[x]"), "Order.\\*\\[x\\]");
        assert_eq!(escape_glob("plain"), "plain");
    }
}
