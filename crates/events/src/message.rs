//! Typed messages carried by the bus.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Correlation property bag attached to commands, responses and notifications
/// (message id, user id, trace state, ...).
pub type MessageState = BTreeMap<String, String>;

/// A payload that can travel over a [`BusTransport`](crate::BusTransport).
///
/// `MESSAGE_TYPE` is the stable type tag used for routing. It must never change
/// once messages of that type have been published.
pub trait Message: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}
