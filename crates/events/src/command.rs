use eventline_core::{MessageId, UserId};

use crate::message::{Message, MessageState};

/// A command targets one logical resource (command abstraction).
///
/// Commands represent **intent** and are transient: they are published on the bus,
/// picked up by a command subscription, and turned into domain events by a handler
/// that loads and saves an aggregate. A command is immutable once dispatched.
///
/// ## Correlation state
///
/// `create_state()` produces the property bag that follows the command through
/// its lifecycle: it is merged into the [`MessageResponse`](crate::MessageResponse)
/// returned to the publisher, used as the logging scope of the handler, and copied
/// onto the `CommandSucceeded` / `CommandFailed` notifications.
pub trait Command: Message {
    /// Unique id of this command instance.
    fn id(&self) -> MessageId;

    /// Originator of the command.
    fn user_id(&self) -> Option<UserId>;

    /// Key of the resource the command targets (aggregate id, entity id, ...).
    fn object_id(&self) -> Option<String> {
        None
    }

    /// Extra properties (e.g. distributed-tracing headers) carried by the command.
    fn trace_properties(&self) -> MessageState {
        MessageState::new()
    }

    fn create_state(&self) -> MessageState {
        let mut state = self.trace_properties();
        state.insert("MessageType".to_string(), Self::MESSAGE_TYPE.to_string());
        state.insert("MessageId".to_string(), self.id().to_string());
        if let Some(user_id) = self.user_id() {
            state.insert("UserId".to_string(), user_id.to_string());
        }
        if let Some(object_id) = self.object_id() {
            state.insert("ObjectId".to_string(), object_id);
        }
        state
    }
}
