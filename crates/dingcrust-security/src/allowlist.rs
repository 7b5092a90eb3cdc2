use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowlistMode {
    /// No entries configured: every sender is accepted.
    Open,
    /// Only listed senders are accepted.
    Restricted,
}

/// Set of sender ids permitted to reach the agent.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: HashSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn open() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> AllowlistMode {
        if self.entries.is_empty() {
            AllowlistMode::Open
        } else {
            AllowlistMode::Restricted
        }
    }

    /// Whether `sender_id` may talk to the agent.
    ///
    /// Composite ids of the form `a|b` are accepted when any part is listed.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        if self.entries.is_empty() || self.entries.contains(sender_id) {
            return true;
        }
        sender_id.contains('|')
            && sender_id
                .split('|')
                .any(|part| !part.is_empty() && self.entries.contains(part))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
