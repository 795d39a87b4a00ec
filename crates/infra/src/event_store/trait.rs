use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use eventline_core::{AggregateId, DomainEvent, ExpectedVersion, UserId};
use eventline_events::Event;
use std::sync::Arc;

/// Stream name of one aggregate instance.
pub fn stream_name(aggregate_type: &str, aggregate_id: AggregateId) -> String {
    format!("{aggregate_type}-{aggregate_id}")
}

/// An event ready to be appended to a stream.
///
/// The version is carried along for diagnostics only; the log assigns the
/// authoritative stream position during append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub time_stamp_utc: DateTime<Utc>,
    pub user_id: Option<UserId>,

    pub payload: JsonValue,
}

/// An event persisted in an append-only stream.
///
/// ## Versions
///
/// - **Zero-based**: the first event of a stream has version `0`
/// - **Contiguous**: each append continues at `current + 1`
/// - **Immutable**: once assigned, versions never change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub version: i64,

    pub event_type: String,
    pub event_version: u32,
    pub time_stamp_utc: DateTime<Utc>,
    pub user_id: Option<UserId>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Decode the payload back into the aggregate's typed domain event.
    pub fn to_domain_event<E>(&self) -> Result<DomainEvent<E>, serde_json::Error>
    where
        E: serde::de::DeserializeOwned,
    {
        Ok(DomainEvent {
            id: self.event_id,
            aggregate_id: self.aggregate_id,
            version: self.version,
            time_stamp_utc: self.time_stamp_utc,
            user_id: self.user_id,
            payload: serde_json::from_value(self.payload.clone())?,
        })
    }
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only event log with optimistic concurrency.
///
/// ## Append Semantics
///
/// `append()`:
/// - checks the stream's current version against `expected_version`
///   (an empty stream is at version `-1`)
/// - assigns versions starting at `current + 1`
/// - persists the whole batch or nothing
///
/// ## Read Semantics
///
/// `read_all()` returns the stream in version order, or an empty vector when
/// the stream does not exist.
///
/// Both operations fail with [`EventLogError::Cancelled`] when `cancel` has
/// already fired before any I/O.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    async fn append(
        &self,
        stream: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError>;

    async fn read_all(
        &self,
        stream: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError>;
}

#[async_trait::async_trait]
impl<L> EventLog for Arc<L>
where
    L: EventLog + ?Sized,
{
    async fn append(
        &self,
        stream: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        (**self).append(stream, events, expected_version, cancel).await
    }

    async fn read_all(
        &self,
        stream: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        (**self).read_all(stream, cancel).await
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    pub fn from_domain_event<E>(
        aggregate_type: impl Into<String>,
        event: &DomainEvent<E>,
    ) -> Result<Self, EventLogError>
    where
        E: Event,
    {
        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| EventLogError::Serialization(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: event.id,
            aggregate_id: event.aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.payload.event_type().to_string(),
            event_version: event.payload.version(),
            time_stamp_utc: event.time_stamp_utc,
            user_id: event.user_id,
            payload,
        })
    }
}
