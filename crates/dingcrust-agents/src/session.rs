use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::providers::{ChatMessage, ChatRole};

/// One turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools_used: Vec<String>,
}

impl SessionMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Local::now(),
            tools_used: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_used = tools;
        self
    }
}

/// Conversation history for one chat.
///
/// `last_consolidated` marks how far into `messages` has already been folded
/// into long-term memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<SessionMessage>,
    pub last_consolidated: usize,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, message: SessionMessage) {
        self.messages.push(message);
    }

    /// Messages not yet consolidated.
    pub fn unconsolidated(&self) -> usize {
        self.messages.len().saturating_sub(self.last_consolidated)
    }

    /// The last `max` messages as provider chat messages.
    pub fn history(&self, max: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max);
        self.messages[start..]
            .iter()
            .filter(|m| matches!(m.role, ChatRole::User | ChatRole::Assistant))
            .map(|m| ChatMessage::text(m.role, m.content.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_consolidated = 0;
    }
}

/// In-memory session store keyed by `channel:chat_id`.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, key: &str) -> &mut Session {
        self.sessions
            .entry(key.to_string())
            .or_insert_with(|| Session::new(key))
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
