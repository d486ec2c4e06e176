use std::collections::HashMap;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message moving between a client, the bot, and human agents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChannelMessage {
    pub id: String,                       // Unique ID (UUID)
    pub conversation_id: String,          // Conversation this message belongs to
    pub direction: MessageDirection,      // Incoming (from client) or Outgoing
    pub timestamp: DateTime<Utc>,         // When it was created
    pub channel: String,                  // Channel the conversation started on
    pub from: Participant,                // Sender
    pub to: Participant,                  // Recipient
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>, // Channel-specific or custom data
}

impl ChannelMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        channel: impl Into<String>,
        direction: MessageDirection,
        from: Participant,
        to: Participant,
        content: MessageContent,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            direction,
            timestamp: Utc::now(),
            channel: channel.into(),
            from,
            to,
            content,
            metadata: HashMap::new(),
        }
    }

    /// Plain text view of the content, if it has one.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Menu { prompt, .. } => Some(prompt),
            MessageContent::Event(_) => None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum MessageDirection {
    #[default]
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Client,
    Bot,
    Agent,
    Team,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub struct Participant {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role, display_name: Option<String>) -> Self {
        Self { id: id.into(), role, display_name }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, Role::Client, None)
    }

    pub fn bot() -> Self {
        Self::new("bot", Role::Bot, Some("flowdesk".to_string()))
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(id, Role::Agent, None)
    }

    /// The waiting queue of a team; messages sent here are visible to every member.
    pub fn team(id: impl Into<String>) -> Self {
        Self::new(id, Role::Team, None)
    }

    pub fn system() -> Self {
        Self::new("system", Role::System, None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Menu { prompt: String, options: Vec<String> },
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Event {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_payload: Option<Value>,
}

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Lenient parse used by the CLI; unknown names fall back to `Info`.
    pub fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_view_of_contents() {
        let msg = ChannelMessage::new(
            "c1",
            "web",
            MessageDirection::Outgoing,
            Participant::bot(),
            Participant::client("alice"),
            MessageContent::Menu { prompt: "Pick one".into(), options: vec!["a".into()] },
        );
        assert_eq!(msg.text(), Some("Pick one"));

        let event = ChannelMessage::new(
            "c1",
            "web",
            MessageDirection::Outgoing,
            Participant::system(),
            Participant::client("alice"),
            MessageContent::Event(Event { event_type: "closed".into(), event_payload: None }),
        );
        assert_eq!(event.text(), None);
    }

    #[test]
    fn content_serializes_snake_case() {
        let content = MessageContent::Text("hi".into());
        assert_eq!(serde_json::to_value(&content).unwrap(), json!({"text": "hi"}));
    }

    #[test]
    fn log_level_parse_is_lenient() {
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Info);
        assert!(LogLevel::Critical > LogLevel::Error);
    }
}
