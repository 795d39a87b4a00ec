use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

use eventline_core::{ExpectedVersion, NEW_AGGREGATE_VERSION};

use super::r#trait::{EventLog, EventLogError, StoredEvent, UncommittedEvent};

/// In-memory append-only event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    streams: RwLock<HashMap<String, Vec<StoredEvent>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> i64 {
        stream.last().map(|e| e.version).unwrap_or(NEW_AGGREGATE_VERSION)
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream: &str,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        if cancel.is_cancelled() {
            return Err(EventLogError::Cancelled);
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        // All events must target the same aggregate.
        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();
        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id || e.aggregate_type != aggregate_type {
                return Err(EventLogError::InvalidAppend(format!(
                    "batch mixes aggregates (index {idx})"
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))?;

        let stored = streams.entry(stream.to_string()).or_default();
        let current = Self::current_version(stored);

        if !expected_version.matches(current) {
            return Err(EventLogError::Concurrency(format!(
                "stream '{stream}': expected {expected_version:?}, found {current}"
            )));
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let event = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                version: next,
                event_type: e.event_type,
                event_version: e.event_version,
                time_stamp_utc: e.time_stamp_utc,
                user_id: e.user_id,
                payload: e.payload,
            };
            next += 1;
            stored.push(event.clone());
            committed.push(event);
        }

        Ok(committed)
    }

    async fn read_all(
        &self,
        stream: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        if cancel.is_cancelled() {
            return Err(EventLogError::Cancelled);
        }

        let streams = self
            .streams
            .read()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))?;

        Ok(streams.get(stream).cloned().unwrap_or_default())
    }
}
