use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::provider::{LockError, LockHandle, LockProvider};

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// In-process lock provider for tests/dev.
///
/// Waiters are woken on every release and otherwise re-check when the current
/// holder's lock would expire.
#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    locks: Mutex<HashMap<String, Held>>,
    released: Notify,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if free (or expired); otherwise report when the holder expires.
    fn try_take(&self, name: &str, ttl: Duration) -> Result<Result<LockHandle, Instant>, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;
        let now = Instant::now();
        if let Some(held) = locks.get(name) {
            if held.expires_at > now {
                return Ok(Err(held.expires_at));
            }
        }
        let token = Uuid::now_v7().to_string();
        locks.insert(
            name.to_string(),
            Held {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Ok(LockHandle::new(name, token)))
    }
}

#[async_trait::async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
        let locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;
        Ok(locks
            .get(name)
            .is_some_and(|held| held.expires_at > Instant::now()))
    }

    async fn acquire(
        &self,
        name: &str,
        ttl: Duration,
        acquire_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, LockError> {
        let deadline = Instant::now() + acquire_timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            // Register interest before checking so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder_expires_at = match self.try_take(name, ttl)? {
                Ok(handle) => return Ok(handle),
                Err(expires_at) => expires_at,
            };
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(name.to_string()));
            }

            let wake_at = holder_expires_at.min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;
            if locks
                .get(handle.name())
                .is_some_and(|held| held.token == handle.token())
            {
                locks.remove(handle.name());
            }
        }
        self.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::lock::{try_using, wait_for_release};

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn bodies_on_the_same_name_never_overlap() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    try_using(&*provider, "order-1", TTL, Duration::from_secs(5), &cancel, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!provider.is_locked("order-1").await.unwrap());
    }

    #[tokio::test]
    async fn held_lock_times_out_waiters() {
        let provider = InMemoryLockProvider::new();
        let cancel = CancellationToken::new();
        let _held = provider.acquire("k", TTL, Duration::ZERO, &cancel).await.unwrap();

        let err = provider
            .acquire("k", TTL, Duration::from_millis(20), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_wait() {
        let provider = InMemoryLockProvider::new();
        let cancel = CancellationToken::new();
        let _held = provider.acquire("k", TTL, Duration::ZERO, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = provider
            .acquire("k", TTL, Duration::from_secs(5), &waiter_cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }

    #[tokio::test]
    async fn expired_lock_is_reclaimable() {
        let provider = InMemoryLockProvider::new();
        let cancel = CancellationToken::new();
        let stale = provider
            .acquire("k", Duration::from_millis(10), Duration::ZERO, &cancel)
            .await
            .unwrap();

        let fresh = provider
            .acquire("k", TTL, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_ne!(stale.token(), fresh.token());

        // The stale owner can no longer release the new holder's lock.
        provider.release(&stale).await.unwrap();
        assert!(provider.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn waiter_proceeds_once_holder_releases() {
        let provider = Arc::new(InMemoryLockProvider::new());
        let cancel = CancellationToken::new();
        let held = provider.acquire("k", TTL, Duration::ZERO, &cancel).await.unwrap();

        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                wait_for_release(&*provider, "k", Duration::from_secs(5), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        provider.release(&held).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn body_error_still_releases_the_lock() {
        let provider = InMemoryLockProvider::new();
        let cancel = CancellationToken::new();

        let result: Result<Result<(), &str>, LockError> =
            try_using(&provider, "k", TTL, Duration::ZERO, &cancel, || async { Err("boom") }).await;

        assert_eq!(result.unwrap(), Err("boom"));
        assert!(!provider.is_locked("k").await.unwrap());
    }
}
