//! Message transport abstraction (mechanics only).
//!
//! This module provides the **bus pattern**: a pub/sub mechanism for distributing
//! commands, domain-event envelopes and notifications to subscribers.
//!
//! ## Design Philosophy
//!
//! The transport is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory tasks, Redis, a broker; anything that can move JSON
//! - **Topic per message type**: subscribers register for one `message_type`
//! - **At-least-once delivery**: consumers must be idempotent
//! - **No persistence**: the event log is the source of truth, not the bus
//!
//! Locking, notifications and typed routing live one level up, in the message bus
//! adapter. A transport only moves [`BusMessage`]s.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::message::{Message, MessageState};

/// A serialized message as it travels on the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub message_type: String,
    pub payload: JsonValue,
    /// Transport headers (trace state, correlation ids).
    pub properties: MessageState,
}

impl BusMessage {
    pub fn encode<T: Message>(message: &T) -> Result<Self, TransportError> {
        let payload =
            serde_json::to_value(message).map_err(|e| TransportError::Serialization(e.to_string()))?;
        Ok(Self {
            message_type: T::MESSAGE_TYPE.to_string(),
            payload,
            properties: MessageState::new(),
        })
    }

    pub fn with_properties(mut self, properties: MessageState) -> Self {
        self.properties = properties;
        self
    }

    /// Decode the payload; fails when the message type tag does not match `T`.
    pub fn decode<T: Message>(&self) -> Result<T, TransportError> {
        if self.message_type != T::MESSAGE_TYPE {
            return Err(TransportError::TypeMismatch {
                expected: T::MESSAGE_TYPE.to_string(),
                found: self.message_type.clone(),
            });
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TransportError::Serialization(e.to_string()))
    }
}

/// Subscriber callback. Handlers own their error handling; the transport only drives them.
pub type BusHandler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Pub/sub transport keyed by message type.
///
/// ## Delivery
///
/// `publish()` hands the message to every live subscriber of `message_type`.
/// With `delay`, delivery happens after the delay has elapsed (subscribers whose
/// token was cancelled in the meantime are skipped).
///
/// `subscribe()` registers a handler until `cancel` fires.
#[async_trait::async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish(
        &self,
        message: BusMessage,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        message_type: &str,
        handler: BusHandler,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl<T> BusTransport for Arc<T>
where
    T: BusTransport + ?Sized,
{
    async fn publish(
        &self,
        message: BusMessage,
        delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        (**self).publish(message, delay, cancel).await
    }

    async fn subscribe(
        &self,
        message_type: &str,
        handler: BusHandler,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        (**self).subscribe(message_type, handler, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const MESSAGE_TYPE: &'static str = "test.ping";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pong {
        n: u32,
    }

    impl Message for Pong {
        const MESSAGE_TYPE: &'static str = "test.pong";
    }

    #[test]
    fn encode_tags_message_with_its_type() {
        let msg = BusMessage::encode(&Ping { n: 3 }).unwrap();
        assert_eq!(msg.message_type, "test.ping");
        assert_eq!(msg.decode::<Ping>().unwrap(), Ping { n: 3 });
    }

    #[test]
    fn decode_rejects_foreign_type_tag() {
        let msg = BusMessage::encode(&Ping { n: 3 }).unwrap();
        let err = msg.decode::<Pong>().unwrap_err();
        assert!(matches!(err, TransportError::TypeMismatch { .. }));
    }
}
