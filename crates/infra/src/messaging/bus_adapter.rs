//! Structured dispatch on top of a raw [`BusTransport`].
//!
//! ## Dispatch contract
//!
//! Every delivery goes through the same wrapper:
//!
//! ```text
//! BusMessage
//!   ↓ decode (type tag checked)
//!   ↓ lock (only when the subscription has a LockScope::By)
//!   ↓ handler -> anyhow::Result<()>
//!   ↓ log outcome (+ CommandSucceeded / CommandFailed for commands)
//! ```
//!
//! Handler errors never reach the transport. Publishing is fire-and-forget:
//! failures are logged and swallowed, except for `publish_command` which reports
//! them through [`MessageResponse::error`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use eventline_core::Aggregate;
use eventline_events::{
    AggregateDomainEventMessage, AggregateEvent, AggregateTypeInfo, ApplicationLifetime, BusHandler, BusMessage,
    BusTransport, Command, CommandFailedNotification, CommandSucceededNotification, Event, Message, MessageResponse,
    MessageState, TransportError,
};

use super::router::{DomainEventRouter, RouteHandler};
use crate::config::LockOptions;
use crate::lock::{LockProvider, try_using};

/// Lock selection for a subscription.
pub enum LockScope<T> {
    /// Run the handler without a lock.
    Unlocked,
    /// Run the handler while holding the lock named by the function's result.
    By(Arc<dyn Fn(&T) -> String + Send + Sync>),
}

impl<T> LockScope<T> {
    pub fn by(key: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        LockScope::By(Arc::new(key))
    }

    fn lock_id(&self, message: &T) -> Option<String> {
        match self {
            LockScope::Unlocked => None,
            LockScope::By(key) => Some(key(message)),
        }
    }
}

impl<T> Clone for LockScope<T> {
    fn clone(&self) -> Self {
        match self {
            LockScope::Unlocked => LockScope::Unlocked,
            LockScope::By(key) => LockScope::By(key.clone()),
        }
    }
}

impl<T> Default for LockScope<T> {
    fn default() -> Self {
        LockScope::Unlocked
    }
}

impl<T> std::fmt::Debug for LockScope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Unlocked => f.write_str("Unlocked"),
            LockScope::By(_) => f.write_str("By(..)"),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Run `body`, holding `lock_id` for its duration when one is given.
async fn run_locked<Fut>(
    locks: &dyn LockProvider,
    lock_options: &LockOptions,
    lock_id: Option<&str>,
    cancel: &CancellationToken,
    body: Fut,
) -> anyhow::Result<()>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    match lock_id {
        None => body.await,
        Some(lock_id) => {
            try_using(
                locks,
                lock_id,
                lock_options.default_ttl,
                lock_options.acquire_timeout,
                cancel,
                move || body,
            )
            .await?
        }
    }
}

async fn publish_on<T: Message>(
    transport: &dyn BusTransport,
    message: &T,
    properties: MessageState,
    delay: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let bus_message = BusMessage::encode(message)?.with_properties(properties);
    transport.publish(bus_message, delay, cancel).await
}

/// Shared state captured by every delivery of one subscription.
struct Dispatch<T, H> {
    handler: H,
    scope: LockScope<T>,
    locks: Arc<dyn LockProvider>,
    lock_options: LockOptions,
}

pub struct MessageBusAdapter {
    transport: Arc<dyn BusTransport>,
    locks: Arc<dyn LockProvider>,
    lifetime: ApplicationLifetime,
    lock_options: LockOptions,
    router: DomainEventRouter,
}

impl std::fmt::Debug for MessageBusAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBusAdapter")
            .field("lifetime", &self.lifetime)
            .field("lock_options", &self.lock_options)
            .field("routes", &self.router.route_count())
            .finish_non_exhaustive()
    }
}

impl MessageBusAdapter {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        locks: Arc<dyn LockProvider>,
        lifetime: ApplicationLifetime,
        lock_options: LockOptions,
    ) -> Self {
        Self {
            transport,
            locks,
            lifetime,
            lock_options,
            router: DomainEventRouter::default(),
        }
    }

    pub fn lifetime(&self) -> &ApplicationLifetime {
        &self.lifetime
    }

    pub fn locks(&self) -> &Arc<dyn LockProvider> {
        &self.locks
    }

    /// Publish a typed message; failures are logged and swallowed.
    #[instrument(skip_all, fields(message_type = T::MESSAGE_TYPE))]
    pub async fn publish<T: Message>(&self, message: &T, delay: Option<Duration>, cancel: &CancellationToken) {
        if let Err(e) = publish_on(&*self.transport, message, MessageState::new(), delay, cancel).await {
            warn!(error = %e, "publish failed");
        }
    }

    /// Publish a pre-built envelope; failures are logged and swallowed.
    #[instrument(skip_all, fields(message_type = %message.message_type))]
    pub async fn publish_raw(&self, message: BusMessage, delay: Option<Duration>, cancel: &CancellationToken) {
        if let Err(e) = self.transport.publish(message, delay, cancel).await {
            warn!(error = %e, "publish failed");
        }
    }

    /// Publish a command; a failed publish is reported through the response, never raised.
    #[instrument(skip_all, fields(message_type = C::MESSAGE_TYPE, message_id = %command.id()))]
    pub async fn publish_command<C: Command>(&self, command: &C, cancel: &CancellationToken) -> MessageResponse {
        let mut response = MessageResponse::for_command(command);
        if let Err(e) = publish_on(&*self.transport, command, response.properties.clone(), None, cancel).await {
            warn!(error = %e, "command publish failed");
            response.error = Some(e.to_string());
        }
        response
    }

    /// Publish several commands concurrently.
    ///
    /// Returns the first response carrying an error, otherwise the first response;
    /// `None` when `commands` is empty. Per-command outcomes beyond the first failure
    /// are not reported.
    pub async fn publish_commands<C: Command>(
        &self,
        commands: &[C],
        cancel: &CancellationToken,
    ) -> Option<MessageResponse> {
        let mut responses = join_all(commands.iter().map(|command| self.publish_command(command, cancel))).await;
        match responses.iter().position(MessageResponse::is_error) {
            Some(failed) => Some(responses.swap_remove(failed)),
            None => responses.into_iter().next(),
        }
    }

    /// Subscribe a handler to messages of type `T` until `cancel` fires.
    #[instrument(skip_all, fields(message_type = T::MESSAGE_TYPE))]
    pub async fn subscribe_message<T, H, Fut>(
        &self,
        handler: H,
        scope: LockScope<T>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>
    where
        T: Message,
        H: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let dispatch = Arc::new(Dispatch {
            handler,
            scope,
            locks: self.locks.clone(),
            lock_options: self.lock_options.clone(),
        });
        let subscription = cancel.clone();

        let bus_handler: BusHandler = Arc::new(move |message: BusMessage| {
            let dispatch = dispatch.clone();
            let subscription = subscription.clone();
            async move {
                let started = Instant::now();
                let message: T = match message.decode() {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(message_type = T::MESSAGE_TYPE, error = %e, "undecodable message dropped");
                        return;
                    }
                };
                let lock_id = dispatch.scope.lock_id(&message);
                debug!(message_type = T::MESSAGE_TYPE, lock_id = ?lock_id, "message handling started");

                let body = (dispatch.handler)(message, subscription.clone());
                let outcome = run_locked(
                    &*dispatch.locks,
                    &dispatch.lock_options,
                    lock_id.as_deref(),
                    &subscription,
                    body,
                )
                .await;

                match outcome {
                    Ok(()) => debug!(
                        message_type = T::MESSAGE_TYPE,
                        elapsed_ms = elapsed_ms(started),
                        "message handling finished"
                    ),
                    Err(e) => error!(
                        message_type = T::MESSAGE_TYPE,
                        elapsed_ms = elapsed_ms(started),
                        error = %format!("{e:#}"),
                        "message handler failed"
                    ),
                }
            }
            .boxed()
        });

        self.transport.subscribe(T::MESSAGE_TYPE, bus_handler, cancel.clone()).await
    }

    /// Subscribe a command handler.
    ///
    /// The subscription stops when `cancel` fires or the application stops. Each
    /// outcome is announced with a `CommandSucceeded` or `CommandFailed` notification
    /// carrying the command's correlation state.
    #[instrument(skip_all, fields(message_type = C::MESSAGE_TYPE))]
    pub async fn subscribe_command<C, H, Fut>(
        &self,
        handler: H,
        scope: LockScope<C>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>
    where
        C: Command,
        H: Fn(C, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let dispatch = Arc::new(Dispatch {
            handler,
            scope,
            locks: self.locks.clone(),
            lock_options: self.lock_options.clone(),
        });
        let transport = self.transport.clone();
        let subscription = self.lifetime.link(cancel);
        let registered = subscription.clone();

        let bus_handler: BusHandler = Arc::new(move |message: BusMessage| {
            let dispatch = dispatch.clone();
            let transport = transport.clone();
            let subscription = subscription.clone();
            async move {
                let started = Instant::now();
                let command: C = match message.decode() {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(message_type = C::MESSAGE_TYPE, error = %e, "undecodable command dropped");
                        return;
                    }
                };
                let state = command.create_state();
                let lock_id = dispatch.scope.lock_id(&command);
                debug!(
                    message_type = C::MESSAGE_TYPE,
                    message_id = %command.id(),
                    lock_id = ?lock_id,
                    "command handling started"
                );

                let body = (dispatch.handler)(command.clone(), subscription.clone());
                let outcome = run_locked(
                    &*dispatch.locks,
                    &dispatch.lock_options,
                    lock_id.as_deref(),
                    &subscription,
                    body,
                )
                .await;

                let published = match outcome {
                    Ok(()) => {
                        debug!(
                            message_type = C::MESSAGE_TYPE,
                            message_id = %command.id(),
                            elapsed_ms = elapsed_ms(started),
                            "command handling finished"
                        );
                        let notification = CommandSucceededNotification::create(&command, state.clone());
                        publish_on(&*transport, &notification, state, None, &subscription).await
                    }
                    Err(e) => {
                        let rendered = format!("{e:#}");
                        error!(
                            message_type = C::MESSAGE_TYPE,
                            message_id = %command.id(),
                            elapsed_ms = elapsed_ms(started),
                            error = %rendered,
                            "command handler failed"
                        );
                        let notification = CommandFailedNotification::create(&command, rendered, state.clone());
                        publish_on(&*transport, &notification, state, None, &subscription).await
                    }
                };
                if let Err(e) = published {
                    warn!(message_type = C::MESSAGE_TYPE, error = %e, "command notification not published");
                }
            }
            .boxed()
        });

        self.transport.subscribe(C::MESSAGE_TYPE, bus_handler, registered).await
    }

    /// Subscribe to one event type of aggregate `A`.
    ///
    /// Only envelopes tagged with `A::AGGREGATE_TYPE` and `E::EVENT_TYPE` reach
    /// `handler`; everything else on the envelope stream is ignored.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, event_type = E::EVENT_TYPE))]
    pub async fn subscribe_aggregate_domain_event<A, E, H, Fut>(
        &self,
        handler: H,
        scope: LockScope<(E, AggregateTypeInfo<A>)>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>
    where
        A: Aggregate,
        A::Event: Event,
        E: AggregateEvent<Aggregate = A>,
        H: Fn(E, AggregateTypeInfo<A>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let dispatch = Arc::new(Dispatch {
            handler,
            scope,
            locks: self.locks.clone(),
            lock_options: self.lock_options.clone(),
        });

        let route: RouteHandler = Arc::new(move |envelope: AggregateDomainEventMessage, cancel: CancellationToken| {
            let dispatch = dispatch.clone();
            async move {
                let started = Instant::now();
                let event = match envelope.typed_event::<E>() {
                    Ok(Some(event)) => event,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(
                            event_id = %envelope.event_id(),
                            event_type = E::EVENT_TYPE,
                            error = %e,
                            "domain event payload does not decode"
                        );
                        return;
                    }
                };
                let keyed = (event, AggregateTypeInfo::<A>::new(envelope.aggregate_id()));
                let lock_id = dispatch.scope.lock_id(&keyed);
                let (event, info) = keyed;
                debug!(
                    event_id = %envelope.event_id(),
                    aggregate_id = %info.aggregate_id(),
                    event_type = E::EVENT_TYPE,
                    lock_id = ?lock_id,
                    "domain event handling started"
                );

                let body = (dispatch.handler)(event, info, cancel.clone());
                let outcome = run_locked(
                    &*dispatch.locks,
                    &dispatch.lock_options,
                    lock_id.as_deref(),
                    &cancel,
                    body,
                )
                .await;

                match outcome {
                    Ok(()) => debug!(
                        event_id = %envelope.event_id(),
                        elapsed_ms = elapsed_ms(started),
                        "domain event handling finished"
                    ),
                    Err(e) => error!(
                        event_id = %envelope.event_id(),
                        event_type = E::EVENT_TYPE,
                        elapsed_ms = elapsed_ms(started),
                        error = %format!("{e:#}"),
                        "domain event handler failed"
                    ),
                }
            }
            .boxed()
        });

        self.router
            .register(
                &*self.transport,
                self.lifetime.stopped(),
                A::AGGREGATE_TYPE,
                E::EVENT_TYPE,
                route,
                cancel.clone(),
            )
            .await
    }
}
