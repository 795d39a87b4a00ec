//! Type-tag dispatch over the single domain-event envelope stream.
//!
//! Every typed domain-event subscription registers a route keyed by
//! `(aggregate_type, event_type)`. The router owns exactly one physical transport
//! subscription to [`AggregateDomainEventMessage`], created on first registration.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use eventline_events::{AggregateDomainEventMessage, BusHandler, BusMessage, BusTransport, Message, TransportError};

/// Typed deserialize-and-invoke closure for one route.
pub(crate) type RouteHandler =
    Arc<dyn Fn(AggregateDomainEventMessage, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

type RouteKey = (String, String);
type RouteTable = RwLock<HashMap<RouteKey, Vec<Route>>>;

#[derive(Clone)]
struct Route {
    handler: RouteHandler,
    cancel: CancellationToken,
}

#[derive(Default)]
pub(crate) struct DomainEventRouter {
    routes: Arc<RouteTable>,
    subscribed: tokio::sync::Mutex<bool>,
}

impl DomainEventRouter {
    /// Add a route; the physical subscription lives until `stream_cancel` fires.
    ///
    /// Once `stream_cancel` has fired the router is closed and registration fails
    /// with [`TransportError::Cancelled`].
    pub(crate) async fn register(
        &self,
        transport: &dyn BusTransport,
        stream_cancel: &CancellationToken,
        aggregate_type: &str,
        event_type: &str,
        handler: RouteHandler,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        if stream_cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        {
            let mut routes = self
                .routes
                .write()
                .map_err(|_| TransportError::Unavailable("route table poisoned".into()))?;
            routes
                .entry((aggregate_type.to_string(), event_type.to_string()))
                .or_default()
                .push(Route { handler, cancel });
        }

        let mut subscribed = self.subscribed.lock().await;
        if !*subscribed {
            let routes = self.routes.clone();
            let physical: BusHandler = Arc::new(move |message: BusMessage| {
                let routes = routes.clone();
                async move { dispatch(&routes, message).await }.boxed()
            });
            transport
                .subscribe(AggregateDomainEventMessage::MESSAGE_TYPE, physical, stream_cancel.clone())
                .await?;
            *subscribed = true;
            debug!("domain event stream subscribed");
        }
        Ok(())
    }

    pub(crate) fn route_count(&self) -> usize {
        self.routes
            .read()
            .map(|routes| routes.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

async fn dispatch(routes: &RouteTable, message: BusMessage) {
    let envelope = match message.decode::<AggregateDomainEventMessage>() {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable domain event envelope dropped");
            return;
        }
    };

    let key = (
        envelope.aggregate_type().to_string(),
        envelope.domain_event_type().to_string(),
    );
    let targets: Vec<Route> = match routes.write() {
        Ok(mut table) => match table.get_mut(&key) {
            Some(list) => {
                list.retain(|route| !route.cancel.is_cancelled());
                list.clone()
            }
            None => Vec::new(),
        },
        Err(_) => {
            warn!("route table poisoned; envelope dropped");
            return;
        }
    };

    if targets.is_empty() {
        debug!(
            aggregate_type = %key.0,
            event_type = %key.1,
            "no route for domain event"
        );
        return;
    }

    // Routes are independent subscriptions; one waiting on its lock must not hold up the rest.
    join_all(
        targets
            .into_iter()
            .map(|route| (route.handler)(envelope.clone(), route.cancel.clone())),
    )
    .await;
}
