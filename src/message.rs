//! Service message types carried by the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kinds of messages exchanged between services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    AiRequest,
    AiResponse,
    LearningEvent,
    UserAction,
    SystemEvent,
    HealthCheck,
    OrchestrationCommand,
}

/// A message exchanged between services over the broker.
///
/// `target_service` of `None` means broadcast; a set value is advisory
/// (delivery is still to every subscriber of the channel, targeting is
/// by channel convention). `correlation_id` links a request to its
/// eventual reply across asynchronous boundaries, and `reply_to` names
/// the channel the reply should be published on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessage {
    /// Globally unique message identifier; consumers dedupe on it.
    pub message_id: Uuid,
    /// Which kind of message this is.
    pub message_type: MessageType,
    /// Name of the service that produced the message.
    pub source_service: String,
    /// Intended recipient; `None` means broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_service: Option<String>,
    /// When the message was created.
    pub timestamp: DateTime<Utc>,
    /// Open JSON payload whose shape depends on `message_type`.
    pub payload: Value,
    /// Links request/response pairs across a workflow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Channel the response should be published on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl ServiceMessage {
    /// Create a new message with a fresh v4 `message_id` and the current time.
    pub fn new(message_type: MessageType, source_service: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type,
            source_service: source_service.into(),
            target_service: None,
            timestamp: Utc::now(),
            payload,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Set the intended recipient.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_service = Some(target.into());
        self
    }

    /// Set the correlation id linking this message to a workflow.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the channel the response should be published on.
    pub fn with_reply_to(mut self, channel: impl Into<String>) -> Self {
        self.reply_to = Some(channel.into());
        self
    }

    /// Build the `AI_RESPONSE` reply to this message, carrying the same
    /// correlation id back to the requester.
    pub fn reply(&self, source_service: impl Into<String>, payload: Value) -> Self {
        let mut reply = Self::new(MessageType::AiResponse, source_service, payload)
            .with_target(self.source_service.clone());
        reply.correlation_id = self.correlation_id.clone();
        reply
    }
}
