//! Aggregate repository: load/save event-sourced aggregates against an [`EventLog`].
//!
//! ## Save cycle
//!
//! ```text
//! load (replay stream) -> execute command(s) -> save(expected version)
//!                                                 ↓
//!                                  1. append uncommitted events (optimistic check)
//!                                  2. publish one envelope per appended event
//!                                  3. clear the uncommitted list
//! ```
//!
//! Concurrency conflicts are detected and surfaced, never retried here; retry
//! policy belongs to the caller. Publication happens after the append is durable,
//! so a failed publish is logged and does not undo the save.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use eventline_core::{Aggregate, AggregateId, AggregateRoot, DomainEvent, ExpectedVersion};
use eventline_events::{AggregateDomainEventMessage, Event, MessageState};

use crate::event_store::{EventLog, EventLogError, StoredEvent, UncommittedEvent, stream_name};
use crate::messaging::MessageBusAdapter;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The stream moved past the version the caller expected.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("aggregate {aggregate_type} {aggregate_id} not found")]
    NotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// A stored payload no longer decodes into the aggregate's event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventLogError),
}

impl From<EventLogError> for RepositoryError {
    fn from(value: EventLogError) -> Self {
        match value {
            EventLogError::Concurrency(msg) => RepositoryError::Concurrency(msg),
            EventLogError::Cancelled => RepositoryError::Cancelled,
            other => RepositoryError::Store(other),
        }
    }
}

/// Event-sourced aggregate repository.
///
/// Aggregates are rebuilt from their stream on every load; nothing is cached
/// in memory between commands.
#[derive(Debug)]
pub struct Repository<L> {
    log: L,
    bus: Arc<MessageBusAdapter>,
}

impl<L> Repository<L> {
    pub fn new(log: L, bus: Arc<MessageBusAdapter>) -> Self {
        Self { log, bus }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), RepositoryError> {
    if cancel.is_cancelled() {
        return Err(RepositoryError::Cancelled);
    }
    Ok(())
}

impl<L: EventLog> Repository<L> {
    /// Rebuild aggregate `id` from its full stream.
    ///
    /// Fails with [`RepositoryError::NotFound`] when the stream is empty. The
    /// returned root is at the version of the last applied event.
    #[instrument(skip_all, fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %id), err)]
    pub async fn load<A>(&self, id: AggregateId, cancel: &CancellationToken) -> Result<AggregateRoot<A>, RepositoryError>
    where
        A: Aggregate,
        A::Event: Event,
    {
        ensure_live(cancel)?;
        let started = Instant::now();

        let history = self.log.read_all(&stream_name(A::AGGREGATE_TYPE, id), cancel).await?;
        if history.is_empty() {
            return Err(RepositoryError::NotFound {
                aggregate_type: A::AGGREGATE_TYPE,
                aggregate_id: id,
            });
        }

        let mut events = decode_history::<A::Event>(&history)?;
        events.sort_by_key(|event| event.version);
        let root = AggregateRoot::from_history(id, events.iter().map(|event| (event.version, &event.payload)));

        debug!(
            version = root.version(),
            events = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregate loaded"
        );
        Ok(root)
    }

    /// Load and assert the aggregate is at `expected_version`.
    pub async fn load_expected<A>(
        &self,
        id: AggregateId,
        expected_version: i64,
        cancel: &CancellationToken,
    ) -> Result<AggregateRoot<A>, RepositoryError>
    where
        A: Aggregate,
        A::Event: Event,
    {
        let root = self.load::<A>(id, cancel).await?;
        if root.version() != expected_version {
            return Err(RepositoryError::Concurrency(format!(
                "{} {id} is at version {}, expected {expected_version}",
                A::AGGREGATE_TYPE,
                root.version()
            )));
        }
        Ok(root)
    }

    /// True iff the stream of `id` has at least one event.
    pub async fn check_exists<A: Aggregate>(
        &self,
        id: AggregateId,
        cancel: &CancellationToken,
    ) -> Result<bool, RepositoryError> {
        ensure_live(cancel)?;
        let history = self.log.read_all(&stream_name(A::AGGREGATE_TYPE, id), cancel).await?;
        Ok(!history.is_empty())
    }

    /// Append the root's uncommitted events under `expected_version`, then publish them.
    ///
    /// `expected_version` is the version before this command's mutations (usually
    /// `root.version()`, or [`ExpectedVersion::NO_STREAM`] for a create). `state` is
    /// the correlation bag copied onto every published envelope.
    ///
    /// Returns the stored events; an empty uncommitted list is a no-op.
    #[instrument(
        skip_all,
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %root.id(), expected = ?expected_version),
        err
    )]
    pub async fn save<A>(
        &self,
        root: &mut AggregateRoot<A>,
        expected_version: ExpectedVersion,
        state: Option<MessageState>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, RepositoryError>
    where
        A: Aggregate,
        A::Event: Event,
    {
        ensure_live(cancel)?;
        if !root.has_uncommitted() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let uncommitted = root
            .uncommitted()
            .iter()
            .map(|event| UncommittedEvent::from_domain_event(A::AGGREGATE_TYPE, event))
            .collect::<Result<Vec<_>, _>>()?;

        let stored = self
            .log
            .append(&stream_name(A::AGGREGATE_TYPE, root.id()), uncommitted, expected_version, cancel)
            .await?;

        let properties = state.unwrap_or_default();
        for (event, committed) in root.uncommitted().iter().zip(&stored) {
            let published = DomainEvent {
                version: committed.version,
                ..event.clone()
            };
            match AggregateDomainEventMessage::from_domain_event::<A>(&published, properties.clone()) {
                Ok(envelope) => self.bus.publish(&envelope, None, cancel).await,
                Err(e) => warn!(event_id = %event.id, error = %e, "domain event envelope not built"),
            }
        }

        if let Some(last) = stored.last() {
            root.mark_committed(last.version);
        }

        debug!(
            version = root.version(),
            appended = stored.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregate saved"
        );
        Ok(stored)
    }
}

fn decode_history<E: Event>(history: &[StoredEvent]) -> Result<Vec<DomainEvent<E>>, RepositoryError> {
    history
        .iter()
        .map(|stored| {
            stored
                .to_domain_event::<E>()
                .map_err(|e| RepositoryError::Deserialize(format!("{} v{}: {e}", stored.event_type, stored.version)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use eventline_core::{DomainError, NEW_AGGREGATE_VERSION};
    use eventline_events::{ApplicationLifetime, InMemoryBusTransport};

    use super::*;
    use crate::config::LockOptions;
    use crate::event_store::InMemoryEventLog;
    use crate::lock::InMemoryLockProvider;
    use crate::messaging::LockScope;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum CounterEvent {
        Added { amount: i64 },
    }

    impl Event for CounterEvent {
        fn event_type(&self) -> &'static str {
            "counter.added"
        }
    }

    impl Aggregate for Counter {
        type Command = i64;
        type Event = CounterEvent;
        type Error = DomainError;

        const AGGREGATE_TYPE: &'static str = "Counter";

        fn new(_id: AggregateId) -> Self {
            Self::default()
        }

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Added { amount } => self.total += amount,
            }
        }

        fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            if *command == 0 {
                return Err(DomainError::validation("amount cannot be zero"));
            }
            Ok(vec![CounterEvent::Added { amount: *command }])
        }
    }

    struct Fixture {
        bus: Arc<InMemoryBusTransport>,
        adapter: Arc<MessageBusAdapter>,
        repository: Repository<Arc<InMemoryEventLog>>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBusTransport::new());
        let adapter = Arc::new(MessageBusAdapter::new(
            bus.clone(),
            Arc::new(InMemoryLockProvider::new()),
            ApplicationLifetime::new(),
            LockOptions::default(),
        ));
        let repository = Repository::new(Arc::new(InMemoryEventLog::new()), adapter.clone());
        Fixture { bus, adapter, repository }
    }

    async fn create(repository: &Repository<Arc<InMemoryEventLog>>, id: AggregateId, amount: i64) {
        let cancel = CancellationToken::new();
        let mut root = AggregateRoot::<Counter>::new(id);
        root.execute(None, &amount).unwrap();
        repository
            .save(&mut root, ExpectedVersion::NO_STREAM, None, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_stream_is_not_found_and_does_not_exist() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let id = AggregateId::new();

        let err = f.repository.load::<Counter>(id, &cancel).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
        assert!(!f.repository.check_exists::<Counter>(id, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn save_then_load_replays_to_last_version() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let id = AggregateId::new();
        create(&f.repository, id, 2).await;

        let mut root = f.repository.load::<Counter>(id, &cancel).await.unwrap();
        assert_eq!(root.version(), 0);
        root.execute(None, &3).unwrap();
        root.execute(None, &4).unwrap();
        let expected = ExpectedVersion::Exact(root.version());
        let stored = f.repository.save(&mut root, expected, None, &cancel).await.unwrap();

        assert_eq!(stored.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(root.version(), 2);
        assert!(!root.has_uncommitted());

        let reloaded = f.repository.load::<Counter>(id, &cancel).await.unwrap();
        assert_eq!(reloaded.version(), 2);
        assert_eq!(reloaded.state().total, 9);
        assert!(f.repository.check_exists::<Counter>(id, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn stale_save_is_a_concurrency_error_and_leaves_the_log_unchanged() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let id = AggregateId::new();
        create(&f.repository, id, 1).await;

        let mut stale = AggregateRoot::<Counter>::new(id);
        stale.execute(None, &5).unwrap();
        let err = f
            .repository
            .save(&mut stale, ExpectedVersion::Exact(NEW_AGGREGATE_VERSION), None, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Concurrency(_)));
        assert!(stale.has_uncommitted());
        let reloaded = f.repository.load::<Counter>(id, &cancel).await.unwrap();
        assert_eq!(reloaded.version(), 0);
        assert_eq!(reloaded.state().total, 1);
    }

    #[tokio::test]
    async fn load_expected_rejects_other_versions() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let id = AggregateId::new();
        create(&f.repository, id, 1).await;

        assert!(f.repository.load_expected::<Counter>(id, 0, &cancel).await.is_ok());
        let err = f.repository.load_expected::<Counter>(id, 3, &cancel).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Concurrency(_)));
    }

    #[tokio::test]
    async fn save_publishes_one_envelope_per_event() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = seen.clone();
        f.adapter
            .subscribe_message(
                move |envelope: AggregateDomainEventMessage, _| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(envelope);
                        Ok(())
                    }
                },
                LockScope::Unlocked,
                &cancel,
            )
            .await
            .unwrap();

        let id = AggregateId::new();
        let mut root = AggregateRoot::<Counter>::new(id);
        root.execute(None, &1).unwrap();
        root.execute(None, &2).unwrap();
        let mut state = MessageState::new();
        state.insert("MessageId".to_string(), "m-1".to_string());
        f.repository
            .save(&mut root, ExpectedVersion::NO_STREAM, Some(state), &cancel)
            .await
            .unwrap();
        f.bus.settle().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_by_key(|envelope| envelope.version());
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.is_aggregate::<Counter>() && e.aggregate_id() == id));
        assert_eq!(seen[1].version(), 1);
        assert_eq!(seen[0].properties().get("MessageId").map(String::as_str), Some("m-1"));
    }

    #[tokio::test]
    async fn failed_save_publishes_nothing() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let published = Arc::new(AtomicUsize::new(0));
        let id = AggregateId::new();
        create(&f.repository, id, 1).await;
        f.bus.settle().await;

        let counter = published.clone();
        f.adapter
            .subscribe_message(
                move |_: AggregateDomainEventMessage, _| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                LockScope::Unlocked,
                &cancel,
            )
            .await
            .unwrap();

        let mut stale = AggregateRoot::<Counter>::new(id);
        stale.execute(None, &5).unwrap();
        let _ = f.repository.save(&mut stale, ExpectedVersion::NO_STREAM, None, &cancel).await;
        f.bus.settle().await;

        assert_eq!(published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_token_fails_before_io() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let id = AggregateId::new();

        let err = f.repository.load::<Counter>(id, &cancel).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Cancelled));

        let mut root = AggregateRoot::<Counter>::new(id);
        root.execute(None, &1).unwrap();
        let err = f
            .repository
            .save(&mut root, ExpectedVersion::NO_STREAM, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Cancelled));
        assert!(root.has_uncommitted());
    }

    proptest::proptest! {
        #[test]
        fn only_one_of_two_racing_saves_wins(first in 1i64..50, second in 1i64..50) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let f = fixture();
                let cancel = CancellationToken::new();
                let id = AggregateId::new();
                create(&f.repository, id, 1).await;

                let mut left = f.repository.load::<Counter>(id, &cancel).await.unwrap();
                let mut right = f.repository.load::<Counter>(id, &cancel).await.unwrap();
                left.execute(None, &first).unwrap();
                right.execute(None, &second).unwrap();

                let (a, b) = tokio::join!(
                    f.repository.save(&mut left, ExpectedVersion::Exact(0), None, &cancel),
                    f.repository.save(&mut right, ExpectedVersion::Exact(0), None, &cancel),
                );
                let conflicts = [a.is_err(), b.is_err()].iter().filter(|failed| **failed).count();
                assert_eq!(conflicts, 1);
                assert_eq!(f.repository.load::<Counter>(id, &cancel).await.unwrap().version(), 1);
            });
        }
    }
}
