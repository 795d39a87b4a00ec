use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lock '{0}'")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Proof of ownership of a held lock; release is token-checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    name: String,
    token: String,
}

impl LockHandle {
    pub fn new(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Distributed lock capability.
///
/// - `acquire()` waits up to `acquire_timeout` for the name to become free, then holds
///   it for at most `ttl` (an expired lock can be taken over).
/// - `release()` only frees the lock if `handle` still owns it.
#[async_trait::async_trait]
pub trait LockProvider: Send + Sync {
    async fn is_locked(&self, name: &str) -> Result<bool, LockError>;

    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError>;

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

#[async_trait::async_trait]
impl<P> LockProvider for Arc<P>
where
    P: LockProvider + ?Sized,
{
    async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        (**self).is_locked(name).await
    }

    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        (**self).acquire(name, ttl, acquire_timeout, cancel).await
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        (**self).release(handle).await
    }
}

/// Acquire `name`, run `body`, release on every exit path (including panics).
///
/// A failed release is logged; the lock then expires after `ttl`.
pub async fn try_using<P, F, Fut, T>(
    provider: &P,
    name: &str,
    ttl: Duration,
    acquire_timeout: Duration,
    cancel: &CancellationToken,
    body: F,
) -> Result<T, LockError>
where
    P: LockProvider + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let handle = provider.acquire(name, ttl, acquire_timeout, cancel).await?;
    debug!(lock_id = name, wait_ms = started.elapsed().as_millis() as u64, "lock acquired");

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;

    if let Err(e) = provider.release(&handle).await {
        warn!(lock_id = name, error = %e, "failed to release lock");
    }
    debug!(lock_id = name, elapsed_ms = started.elapsed().as_millis() as u64, "lock released");

    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Block until whoever holds `name` releases it (or it expires).
pub async fn wait_for_release<P>(
    provider: &P,
    name: &str,
    acquire_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), LockError>
where
    P: LockProvider + ?Sized,
{
    try_using(provider, name, acquire_timeout, acquire_timeout, cancel, || async {}).await
}
