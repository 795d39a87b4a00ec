//! In-memory transport for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusHandler, BusMessage, BusTransport, TransportError};

struct Subscriber {
    handler: BusHandler,
    cancel: CancellationToken,
}

/// In-memory pub/sub transport.
///
/// - One tokio task per delivery
/// - Best-effort fan-out
/// - Cancelled subscribers and finished deliveries are dropped on the next publish
#[derive(Default)]
pub struct InMemoryBusTransport {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl InMemoryBusTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until every delivery started so far (and any delivery those started) has finished.
    pub async fn settle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = match self.in_flight.lock() {
                Ok(mut in_flight) => in_flight.drain(..).collect(),
                Err(_) => return,
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "bus delivery task failed");
                }
            }
        }
    }

    pub fn subscriber_count(&self, message_type: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| {
                subs.get(message_type)
                    .map(|list| list.iter().filter(|s| !s.cancel.is_cancelled()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryBusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBusTransport").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BusTransport for InMemoryBusTransport {
    async fn publish(
        &self,
        message: BusMessage,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let targets: Vec<(BusHandler, CancellationToken)> = {
            let mut subs = self
                .subscribers
                .lock()
                .map_err(|_| TransportError::Unavailable("subscriber registry poisoned".into()))?;
            let Some(list) = subs.get_mut(&message.message_type) else {
                return Ok(());
            };
            list.retain(|s| !s.cancel.is_cancelled());
            list.iter()
                .map(|s| (s.handler.clone(), s.cancel.clone()))
                .collect()
        };

        let mut spawned = Vec::with_capacity(targets.len());
        for (handler, sub_cancel) in targets {
            let message = message.clone();
            spawned.push(tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = sub_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if sub_cancel.is_cancelled() {
                    return;
                }
                handler(message).await;
            }));
        }

        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| TransportError::Unavailable("delivery registry poisoned".into()))?;
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.extend(spawned);

        Ok(())
    }

    async fn subscribe(
        &self,
        message_type: &str,
        handler: BusHandler,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| TransportError::Unavailable("subscriber registry poisoned".into()))?;
        subs.entry(message_type.to_string())
            .or_default()
            .push(Subscriber { handler, cancel });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use serde_json::json;

    use super::*;

    fn counting_handler(counter: Arc<AtomicUsize>) -> BusHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn message(message_type: &str) -> BusMessage {
        BusMessage {
            message_type: message_type.to_string(),
            payload: json!({}),
            properties: Default::default(),
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_of_the_type() {
        let bus = InMemoryBusTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        bus.subscribe("a", counting_handler(hits.clone()), cancel.clone()).await.unwrap();
        bus.subscribe("a", counting_handler(hits.clone()), cancel.clone()).await.unwrap();
        bus.subscribe("b", counting_handler(other.clone()), cancel.clone()).await.unwrap();

        bus.publish(message("a"), None, &cancel).await.unwrap();
        bus.settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let bus = InMemoryBusTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sub_cancel = CancellationToken::new();
        let publish_cancel = CancellationToken::new();

        bus.subscribe("a", counting_handler(hits.clone()), sub_cancel.clone()).await.unwrap();
        sub_cancel.cancel();

        bus.publish(message("a"), None, &publish_cancel).await.unwrap();
        bus.settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[tokio::test]
    async fn delayed_publish_delivers_after_delay() {
        let bus = InMemoryBusTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        bus.subscribe("a", counting_handler(hits.clone()), cancel.clone()).await.unwrap();

        bus.publish(message("a"), Some(Duration::from_millis(20)), &cancel)
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_cancelled_token_fails() {
        let bus = InMemoryBusTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bus.publish(message("a"), None, &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn finished_deliveries_are_not_retained() {
        let bus = InMemoryBusTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        bus.subscribe("a", counting_handler(hits.clone()), cancel.clone()).await.unwrap();

        for _ in 0..1_000 {
            bus.publish(message("a"), None, &cancel).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) < 1_000 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(message("a"), None, &cancel).await.unwrap();
        assert!(bus.in_flight.lock().unwrap().len() <= 1);

        bus.settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1_001);
    }
}
