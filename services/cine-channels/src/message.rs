//! Message types for channel communication.

use serde::{Deserialize, Serialize};

const MESSAGE_APOLOGY: &str = "I'm sorry, I encountered an error while processing your message.";
const MENTION_APOLOGY: &str = "I'm sorry, I encountered an error while processing your mention.";

/// Which platform event delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Plain message posted in a channel the bot can read
    Message,
    /// Message that explicitly mentions the bot
    Mention,
}

impl EventKind {
    /// Get the event kind as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Mention => "app_mention",
        }
    }

    /// Reply sent when handling this kind of event fails outright.
    pub const fn apology(&self) -> &'static str {
        match self {
            Self::Message => MESSAGE_APOLOGY,
            Self::Mention => MENTION_APOLOGY,
        }
    }
}

/// Who authored an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Human,
    /// The bot itself (or another bot integration)
    Bot,
}

/// Payload shared by every inbound event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Conversation identifier (Slack channel ID)
    pub channel_id: String,
    /// Author user ID, absent for some integration posts
    #[serde(default)]
    pub user_id: Option<String>,
    /// Raw message text, possibly empty
    pub text: String,
    /// Platform message timestamp / ID
    #[serde(default)]
    pub ts: Option<String>,
    pub sender: Sender,
    /// Receive time (Unix millis)
    pub timestamp: i64,
}

/// A validated inbound event from the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(ChatMessage),
    Mention(ChatMessage),
}

impl InboundEvent {
    /// Build an event from a human sender, stamped now.
    pub fn from_human(kind: EventKind, channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        let message = ChatMessage {
            channel_id: channel_id.into(),
            user_id: None,
            text: text.into(),
            ts: None,
            sender: Sender::Human,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        Self::new(kind, message)
    }

    pub fn new(kind: EventKind, message: ChatMessage) -> Self {
        match kind {
            EventKind::Message => Self::Message(message),
            EventKind::Mention => Self::Mention(message),
        }
    }

    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::Mention(_) => EventKind::Mention,
        }
    }

    pub const fn message(&self) -> &ChatMessage {
        match self {
            Self::Message(m) | Self::Mention(m) => m,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.message().channel_id
    }

    pub fn text(&self) -> &str {
        &self.message().text
    }

    pub fn is_from_bot(&self) -> bool {
        self.message().sender == Sender::Bot
    }
}

/// Outgoing text reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target channel ID
    pub channel_id: String,
    pub text: String,
}

impl OutgoingMessage {
    pub fn text(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = InboundEvent::from_human(EventKind::Mention, "C1", "<@UBOT> hi");
        assert_eq!(event.kind(), EventKind::Mention);
        assert_eq!(event.channel_id(), "C1");
        assert_eq!(event.text(), "<@UBOT> hi");
        assert!(!event.is_from_bot());
    }

    #[test]
    fn test_apology_depends_on_kind() {
        assert!(EventKind::Message.apology().ends_with("your message."));
        assert!(EventKind::Mention.apology().ends_with("your mention."));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = InboundEvent::from_human(EventKind::Message, "C9", "hello");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["message"]["channel_id"], "C9");
        assert_eq!(json["message"]["sender"], "human");
    }
}
