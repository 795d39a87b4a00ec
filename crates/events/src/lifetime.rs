use tokio_util::sync::CancellationToken;

/// Process-wide stop signal.
///
/// Every handler invocation runs under a token linked to [`stopped`](Self::stopped),
/// so stopping the application cancels in-flight handlers.
#[derive(Debug, Clone, Default)]
pub struct ApplicationLifetime {
    stopped: CancellationToken,
}

impl ApplicationLifetime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stopped(&self) -> &CancellationToken {
        &self.stopped
    }

    pub fn stop(&self) {
        self.stopped.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Token that fires when either the application stops or `other` is cancelled.
    pub fn link(&self, other: &CancellationToken) -> CancellationToken {
        let linked = self.stopped.child_token();
        if other.is_cancelled() {
            linked.cancel();
            return linked;
        }

        let other = other.clone();
        let watched = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = other.cancelled() => watched.cancel(),
                _ = watched.cancelled() => {}
            }
        });
        linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopping_the_application_cancels_linked_tokens() {
        let lifetime = ApplicationLifetime::new();
        let caller = CancellationToken::new();
        let linked = lifetime.link(&caller);

        lifetime.stop();

        assert!(linked.is_cancelled());
        assert!(!caller.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_the_caller_cancels_linked_token() {
        let lifetime = ApplicationLifetime::new();
        let caller = CancellationToken::new();
        let linked = lifetime.link(&caller);

        caller.cancel();
        linked.cancelled().await;

        assert!(!lifetime.is_stopped());
    }

    #[tokio::test]
    async fn already_cancelled_caller_yields_cancelled_token() {
        let lifetime = ApplicationLifetime::new();
        let caller = CancellationToken::new();
        caller.cancel();

        assert!(lifetime.link(&caller).is_cancelled());
    }
}
