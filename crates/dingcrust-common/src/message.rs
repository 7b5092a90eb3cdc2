use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form routing and context fields carried alongside a message.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata flag marking an outbound message as an intermediate progress update.
pub const PROGRESS_KEY: &str = "_progress";

/// A message received from a channel, on its way to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Key identifying the conversation this message belongs to.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// A message produced by the agent, to be delivered through a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub metadata: Metadata,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Build a final reply to `inbound`, carrying over its routing metadata.
    pub fn reply_to(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        Self {
            channel: inbound.channel.clone(),
            chat_id: inbound.chat_id.clone(),
            content: content.into(),
            metadata: inbound.metadata.clone(),
        }
    }

    /// Build a progress update for `inbound`.
    pub fn progress_for(inbound: &InboundMessage, content: impl Into<String>) -> Self {
        Self::reply_to(inbound, content).as_progress()
    }

    pub fn as_progress(mut self) -> Self {
        self.metadata
            .insert(PROGRESS_KEY.to_string(), serde_json::Value::Bool(true));
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_progress(&self) -> bool {
        self.metadata
            .get(PROGRESS_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
