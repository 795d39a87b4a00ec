//! Event-sourced aggregate model.
//!
//! An aggregate is split in two parts:
//!
//! - [`Aggregate`]: the pure, deterministic domain state (`apply` + `handle`).
//! - [`AggregateRoot`]: the in-memory reconstruction that owns the committed
//!   version and the list of uncommitted events raised since the last save.
//!
//! Aggregate roots are short-lived: a repository rebuilds one from the event
//! stream for every command and drops it after the save cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{AggregateId, UserId};

/// Version of an aggregate whose stream has no events yet.
pub const NEW_AGGREGATE_VERSION: i64 = -1;

/// Optimistic concurrency expectation for a stream.
///
/// Versions are zero-based: the first event of a stream has version `0`, an
/// empty stream is at [`NEW_AGGREGATE_VERSION`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be at an exact version.
    Exact(i64),
}

impl ExpectedVersion {
    /// The stream must not exist yet.
    pub const NO_STREAM: ExpectedVersion = ExpectedVersion::Exact(NEW_AGGREGATE_VERSION);

    pub fn matches(self, actual: i64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

impl From<i64> for ExpectedVersion {
    fn from(value: i64) -> Self {
        ExpectedVersion::Exact(value)
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO. Version tracking is done by [`AggregateRoot`].
pub trait Aggregate: Send + Sync + 'static {
    type Command: Clone + core::fmt::Debug + Send + Sync;
    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Stable aggregate name, used for stream names and envelope type tags.
    const AGGREGATE_TYPE: &'static str;

    /// Fresh, not-yet-created state for `id`.
    fn new(id: AggregateId) -> Self;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

/// Immutable fact raised by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent<E> {
    pub id: Uuid,
    pub aggregate_id: AggregateId,
    /// Position in the aggregate stream (zero-based, monotonic).
    pub version: i64,
    pub time_stamp_utc: DateTime<Utc>,
    pub user_id: Option<UserId>,
    pub payload: E,
}

/// In-memory reconstruction of an aggregate from its event sequence.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    version: i64,
    state: A,
    uncommitted: Vec<DomainEvent<A::Event>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Factory for a brand new aggregate (no stream yet).
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: NEW_AGGREGATE_VERSION,
            state: A::new(id),
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild an aggregate by replaying persisted events in version order.
    ///
    /// The resulting version equals the version of the last applied event.
    pub fn from_history<'a>(
        id: AggregateId,
        history: impl IntoIterator<Item = (i64, &'a A::Event)>,
    ) -> Self {
        let mut root = Self::new(id);
        for (version, event) in history {
            root.state.apply(event);
            root.version = version;
        }
        root
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    /// Last committed version (the version a save must expect).
    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn is_new(&self) -> bool {
        self.version == NEW_AGGREGATE_VERSION
    }

    pub fn uncommitted(&self) -> &[DomainEvent<A::Event>] {
        &self.uncommitted
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Domain behavior: apply an event to the state and record it for the next save.
    pub fn raise(&mut self, user_id: Option<UserId>, event: A::Event) {
        self.state.apply(&event);
        let version = self.version + self.uncommitted.len() as i64 + 1;
        self.uncommitted.push(DomainEvent {
            id: Uuid::now_v7(),
            aggregate_id: self.id,
            version,
            time_stamp_utc: Utc::now(),
            user_id,
            payload: event,
        });
    }

    /// Decide on a command and raise every resulting event.
    pub fn execute(&mut self, user_id: Option<UserId>, command: &A::Command) -> Result<usize, A::Error> {
        let events = self.state.handle(command)?;
        let count = events.len();
        for event in events {
            self.raise(user_id, event);
        }
        Ok(count)
    }

    /// Drop the uncommitted list after a successful append that ended at `version`.
    pub fn mark_committed(&mut self, version: i64) {
        self.uncommitted.clear();
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counter {
        total: i64,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum CounterEvent {
        Added(i64),
    }

    impl Aggregate for Counter {
        type Command = i64;
        type Event = CounterEvent;
        type Error = DomainError;

        const AGGREGATE_TYPE: &'static str = "counter";

        fn new(_id: AggregateId) -> Self {
            Self { total: 0 }
        }

        fn apply(&mut self, event: &Self::Event) {
            match event {
                CounterEvent::Added(n) => self.total += n,
            }
        }

        fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            if *command == 0 {
                return Err(DomainError::validation("amount cannot be zero"));
            }
            Ok(vec![CounterEvent::Added(*command)])
        }
    }

    #[test]
    fn new_root_has_no_stream() {
        let root = AggregateRoot::<Counter>::new(AggregateId::new());
        assert!(root.is_new());
        assert_eq!(root.version(), NEW_AGGREGATE_VERSION);
    }

    #[test]
    fn replay_sets_version_to_last_event() {
        let events = [CounterEvent::Added(2), CounterEvent::Added(3)];
        let root = AggregateRoot::<Counter>::from_history(
            AggregateId::new(),
            events.iter().enumerate().map(|(i, e)| (i as i64, e)),
        );
        assert_eq!(root.version(), 1);
        assert_eq!(root.state().total, 5);
        assert!(!root.has_uncommitted());
    }

    #[test]
    fn execute_records_uncommitted_events_with_next_versions() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new());
        root.execute(None, &4).unwrap();
        root.execute(None, &1).unwrap();

        let versions: Vec<i64> = root.uncommitted().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![0, 1]);
        assert_eq!(root.version(), NEW_AGGREGATE_VERSION);

        root.mark_committed(1);
        assert!(!root.has_uncommitted());
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn rejected_command_raises_nothing() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new());
        assert!(root.execute(None, &0).is_err());
        assert!(!root.has_uncommitted());
    }

    proptest::proptest! {
        #[test]
        fn replayed_version_is_index_of_last_event(amounts in proptest::collection::vec(1i64..100, 1..50)) {
            let events: Vec<CounterEvent> = amounts.iter().copied().map(CounterEvent::Added).collect();
            let root = AggregateRoot::<Counter>::from_history(
                AggregateId::new(),
                events.iter().enumerate().map(|(i, e)| (i as i64, e)),
            );
            proptest::prop_assert_eq!(root.version(), amounts.len() as i64 - 1);
            proptest::prop_assert_eq!(root.state().total, amounts.iter().sum::<i64>());
        }
    }

    #[test]
    fn expected_version_check() {
        assert!(ExpectedVersion::Any.matches(7));
        assert!(ExpectedVersion::NO_STREAM.matches(NEW_AGGREGATE_VERSION));
        assert!(ExpectedVersion::Exact(0).check(1).is_err());
    }
}
