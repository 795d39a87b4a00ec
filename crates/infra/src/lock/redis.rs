//! Redis-backed lock provider (optional).
//!
//! Locks are plain keys written with `SET NX PX`; release runs a compare-and-delete
//! script so a holder whose lock already expired cannot free someone else's lock.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use super::provider::{LockError, LockHandle, LockProvider};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Default key prefix for lock entries.
const DEFAULT_KEY_PREFIX: &str = "eventline:lock:";

/// Delay between acquisition attempts while the lock is held elsewhere.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RedisLockProvider {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockProvider")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLockProvider {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }
}

#[async_trait::async_trait]
impl LockProvider for RedisLockProvider {
    async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(self.key(name))
            .query_async::<_, bool>(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("EXISTS failed: {e}")))
    }

    #[instrument(skip(self, cancel), fields(lock_id = %name), err)]
    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        let key = self.key(name);
        let token = Uuid::now_v7().to_string();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let deadline = Instant::now() + acquire_timeout;
        let mut conn = self.conn.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(format!("SET NX failed: {e}")))?;
            if acquired.is_some() {
                return Ok(LockHandle::new(name, token));
            }

            if Instant::now() >= deadline {
                return Err(LockError::Timeout(name.to_string()));
            }
            let wake_at = (Instant::now() + RETRY_INTERVAL).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(handle.name()))
            .arg(handle.token())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("release script failed: {e}")))?;
        Ok(())
    }
}
