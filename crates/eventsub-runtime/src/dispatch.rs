//! # Message Dispatch
//!
//! Parses `channel.chat.message` notifications out of EventSub frames and
//! hands them to externally registered handlers. The "message" handler is
//! invoked for every chat event; the "command" handler additionally fires
//! when the text starts with `!`. Handler failures are logged and never
//! break the listen loop.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::RuntimeResult;

const NOTIFICATION_TYPE: &str = "notification";
const CHAT_MESSAGE_TYPE: &str = "channel.chat.message";

/// A parsed chat message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Login of the user who sent the message.
    pub chatter: String,
    /// Lowercase login of the channel broadcaster.
    pub channel: String,
    /// Message text.
    pub text: String,
}

/// Externally registered asynchronous chat handler.
pub type ChatHandler = Arc<dyn Fn(ChatEvent) -> BoxFuture<'static, RuntimeResult<()>> + Send + Sync>;

/// Routes chat notifications to the registered handlers.
#[derive(Default)]
pub struct MessageDispatcher {
    message_handler: std::sync::RwLock<Option<ChatHandler>>,
    command_handler: std::sync::RwLock<Option<ChatHandler>>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler invoked for every chat message.
    pub fn set_message_handler(&self, handler: ChatHandler) {
        *self
            .message_handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    /// Set the handler additionally invoked for `!`-prefixed messages.
    pub fn set_command_handler(&self, handler: ChatHandler) {
        *self
            .command_handler
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handler);
    }

    fn handler(
        slot: &std::sync::RwLock<Option<ChatHandler>>,
    ) -> Option<ChatHandler> {
        slot.read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Dispatch one already-parsed EventSub frame.
    ///
    /// Non-notification frames and notification types other than chat
    /// messages are ignored. Chat events missing a required string field
    /// are dropped with a log line.
    pub async fn dispatch(&self, data: &Value) {
        if !is_notification(data) {
            return;
        }
        let Some(event) = parse_chat_event(data) else {
            return;
        };

        if let Some(handler) = Self::handler(&self.message_handler) {
            if let Err(e) = handler(event.clone()).await {
                tracing::warn!(error = %e, "Error in message handler");
            }
        }

        if event.text.starts_with('!') {
            if let Some(handler) = Self::handler(&self.command_handler) {
                if let Err(e) = handler(event.clone()).await {
                    tracing::warn!(error = %e, "Error in command handler");
                }
            }
        }
    }
}

fn is_notification(data: &Value) -> bool {
    data.get("metadata")
        .and_then(|m| m.get("message_type"))
        .and_then(Value::as_str)
        == Some(NOTIFICATION_TYPE)
}

/// Extract a chat event from a notification payload. Returns `None` (with
/// a log line for malformed events) when this is not a chat message or a
/// required field is missing.
fn parse_chat_event(data: &Value) -> Option<ChatEvent> {
    let payload = data.get("payload")?;
    let sub_type = payload
        .get("subscription")?
        .get("type")?
        .as_str()?;
    if sub_type != CHAT_MESSAGE_TYPE {
        return None;
    }

    let event = payload.get("event")?;
    let chatter = event.get("chatter_user_name").and_then(Value::as_str);
    let broadcaster = event.get("broadcaster_user_name").and_then(Value::as_str);
    let text = event
        .get("message")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str);

    match (chatter, broadcaster, text) {
        (Some(chatter), Some(broadcaster), Some(text)) => Some(ChatEvent {
            chatter: chatter.to_string(),
            channel: broadcaster.to_lowercase(),
            text: text.to_string(),
        }),
        _ => {
            tracing::warn!("Chat event missing required string fields, dropping");
            None
        }
    }
}
