//! Notifications published by the runtime itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventline_core::{MessageId, UserId};

use crate::command::Command;
use crate::message::{Message, MessageState};

/// A command handler completed without error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSucceededNotification {
    pub id: MessageId,
    pub time_stamp_utc: DateTime<Utc>,
    pub user_id: Option<UserId>,
    pub command_id: MessageId,
    pub command_type: String,
    pub state: MessageState,
}

impl Message for CommandSucceededNotification {
    const MESSAGE_TYPE: &'static str = "eventline.command_succeeded";
}

impl CommandSucceededNotification {
    pub fn create<C: Command>(command: &C, state: MessageState) -> Self {
        Self {
            id: Uuid::now_v7(),
            time_stamp_utc: Utc::now(),
            user_id: command.user_id(),
            command_id: command.id(),
            command_type: C::MESSAGE_TYPE.to_string(),
            state,
        }
    }
}

/// A command handler failed; `error` carries the rendered error chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailedNotification {
    pub id: MessageId,
    pub time_stamp_utc: DateTime<Utc>,
    pub user_id: Option<UserId>,
    pub command_id: MessageId,
    pub command_type: String,
    pub error: String,
    pub state: MessageState,
}

impl Message for CommandFailedNotification {
    const MESSAGE_TYPE: &'static str = "eventline.command_failed";
}

impl CommandFailedNotification {
    pub fn create<C: Command>(command: &C, error: impl Into<String>, state: MessageState) -> Self {
        Self {
            id: Uuid::now_v7(),
            time_stamp_utc: Utc::now(),
            user_id: command.user_id(),
            command_id: command.id(),
            command_type: C::MESSAGE_TYPE.to_string(),
            error: error.into(),
            state,
        }
    }
}

/// Kind of change a projector applied to a read entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityChange {
    Inserted,
    Updated,
    Deleted,
}

/// Live-update payload for connected clients, emitted only during live processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChangedNotification {
    pub id: MessageId,
    pub time_stamp_utc: DateTime<Utc>,
    pub entity_type: String,
    pub entity_id: String,
    pub change: EntityChange,
    /// Id of the domain event that caused the change.
    pub event_id: Option<Uuid>,
    /// Projector-specific identifier item (what clients need to refresh the entity).
    pub identifier: JsonValue,
}

impl Message for EntityChangedNotification {
    const MESSAGE_TYPE: &'static str = "eventline.entity_changed";
}
