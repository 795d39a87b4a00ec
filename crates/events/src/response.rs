use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventline_core::{MessageId, UserId};

use crate::command::Command;
use crate::message::MessageState;

/// Outcome of publishing a command.
///
/// Publishing never fails towards the caller; a failed publish is reported through
/// `error`. Handler outcomes arrive later as notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message_id: MessageId,
    pub user_id: Option<UserId>,
    pub error: Option<String>,
    pub properties: MessageState,
}

impl MessageResponse {
    pub fn for_command<C: Command>(command: &C) -> Self {
        Self {
            message_id: command.id(),
            user_id: command.user_id(),
            error: None,
            properties: command.create_state(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Default for MessageResponse {
    fn default() -> Self {
        Self {
            message_id: Uuid::nil(),
            user_id: None,
            error: None,
            properties: MessageState::new(),
        }
    }
}
