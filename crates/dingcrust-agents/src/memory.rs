//! File-backed agent memory.
//!
//! Layout under `<workspace>/memory/`:
//! - `YYYY-MM-DD.md` daily notes
//! - `MEMORY.md` long-term facts, rewritten by consolidation
//! - `HISTORY.md` append-only log of consolidated conversation summaries

use std::path::{Path, PathBuf};

use chrono::{Duration, Local, NaiveDate};
use dingcrust_common::{Error, Result};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::providers::{ChatMessage, LlmProvider, LlmRequest, ToolDefinition};
use crate::session::Session;

const MEMORY_FILE: &str = "MEMORY.md";
const HISTORY_FILE: &str = "HISTORY.md";
const SAVE_MEMORY_TOOL: &str = "save_memory";
const CONSOLIDATION_SYSTEM_PROMPT: &str = "You are a memory consolidation agent. Call the save_memory tool with your consolidation of the conversation.";

pub struct MemoryStore {
    memory_dir: PathBuf,
}

impl MemoryStore {
    /// Open the store, creating `<workspace>/memory` if needed.
    pub async fn open(workspace: &Path) -> Result<Self> {
        let memory_dir = workspace.join("memory");
        tokio::fs::create_dir_all(&memory_dir).await?;
        Ok(Self { memory_dir })
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.memory_dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    fn today_file(&self) -> PathBuf {
        self.day_file(Local::now().date_naive())
    }

    pub async fn read_today(&self) -> Result<String> {
        read_or_empty(&self.today_file()).await
    }

    pub async fn append_today(&self, content: &str) -> Result<()> {
        let path = self.today_file();
        let existing = read_or_empty(&path).await?;
        let updated = if existing.is_empty() {
            format!("# {}\n\n{content}", Local::now().format("%Y-%m-%d"))
        } else {
            format!("{existing}\n{content}")
        };
        tokio::fs::write(&path, updated).await?;
        Ok(())
    }

    pub async fn read_long_term(&self) -> Result<String> {
        read_or_empty(&self.memory_dir.join(MEMORY_FILE)).await
    }

    pub async fn write_long_term(&self, content: &str) -> Result<()> {
        tokio::fs::write(self.memory_dir.join(MEMORY_FILE), content).await?;
        Ok(())
    }

    /// Daily notes from the last `days` days, newest first.
    pub async fn get_recent_memories(&self, days: u32) -> Result<String> {
        let today = Local::now().date_naive();
        let mut notes = Vec::new();
        for offset in 0..days {
            let date = today - Duration::days(i64::from(offset));
            let content = read_or_empty(&self.day_file(date)).await?;
            if !content.is_empty() {
                notes.push(content);
            }
        }
        Ok(notes.join("\n\n---\n\n"))
    }

    /// Long-term memory and today's notes, formatted for a system prompt.
    pub async fn get_memory_context(&self) -> Result<String> {
        let mut parts = Vec::new();
        let long_term = self.read_long_term().await?;
        if !long_term.is_empty() {
            parts.push(format!("## Long-term Memory\n{long_term}"));
        }
        let today = self.read_today().await?;
        if !today.is_empty() {
            parts.push(format!("## Today's Notes\n{today}"));
        }
        Ok(parts.join("\n\n"))
    }

    pub async fn append_history(&self, entry: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.memory_dir.join(HISTORY_FILE))
            .await?;
        file.write_all(format!("{}\n\n", entry.trim_end()).as_bytes())
            .await?;
        Ok(())
    }

    /// Fold old session messages into `MEMORY.md` and `HISTORY.md`.
    ///
    /// Keeps the most recent `memory_window / 2` messages unless `archive_all`
    /// is set. Returns `true` on success or when there is nothing to do.
    pub async fn consolidate(
        &self,
        session: &mut Session,
        provider: &dyn LlmProvider,
        model: &str,
        archive_all: bool,
        memory_window: usize,
    ) -> bool {
        match self
            .try_consolidate(session, provider, model, archive_all, memory_window)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("memory: consolidation failed: {e}");
                false
            }
        }
    }

    async fn try_consolidate(
        &self,
        session: &mut Session,
        provider: &dyn LlmProvider,
        model: &str,
        archive_all: bool,
        memory_window: usize,
    ) -> Result<()> {
        let keep_count = if archive_all { 0 } else { memory_window / 2 };
        let total = session.messages.len();
        let range = if archive_all {
            0..total
        } else {
            if total <= keep_count || session.last_consolidated >= total - keep_count {
                return Ok(());
            }
            session.last_consolidated..total - keep_count
        };
        info!(
            "memory: consolidating {} message(s) of {}, keeping {keep_count}",
            range.len(),
            session.key
        );

        let lines: Vec<String> = session.messages[range]
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| {
                let tools = if m.tools_used.is_empty() {
                    String::new()
                } else {
                    format!(" [tools: {}]", m.tools_used.join(", "))
                };
                format!(
                    "[{}] {}{tools}: {}",
                    m.timestamp.format("%Y-%m-%d %H:%M"),
                    m.role.as_str().to_uppercase(),
                    m.content
                )
            })
            .collect();

        let current_memory = self.read_long_term().await?;
        let prompt = format!(
            "Process this conversation and call the save_memory tool with your consolidation.\n\n\
             ## Current Long-term Memory\n{}\n\n\
             ## Conversation to Process\n{}",
            if current_memory.is_empty() {
                "(empty)"
            } else {
                current_memory.as_str()
            },
            lines.join("\n")
        );

        let mut request = LlmRequest::new(model, vec![ChatMessage::user(prompt)]);
        request.system = Some(CONSOLIDATION_SYSTEM_PROMPT.to_string());
        request.tools = vec![save_memory_tool()];
        let response = provider.complete(&request).await?;

        // Only one tool is offered, so the first call is taken as save_memory
        // whatever name the model gave it.
        let (_, input) = response
            .first_tool_use()
            .ok_or_else(|| Error::Memory("model did not call save_memory".into()))?;
        let args = match input {
            Value::String(raw) => serde_json::from_str::<Value>(raw)?,
            other => other.clone(),
        };
        let Value::Object(args) = args else {
            return Err(Error::Memory("save_memory arguments are not an object".into()));
        };

        if let Some(entry) = args.get("history_entry").and_then(as_text) {
            self.append_history(&entry).await?;
        }
        if let Some(update) = args.get("memory_update").and_then(as_text)
            && update != current_memory
        {
            self.write_long_term(&update).await?;
        }

        session.last_consolidated = total - keep_count;
        info!(
            "memory: consolidation done for {}, last_consolidated={}",
            session.key, session.last_consolidated
        );
        Ok(())
    }
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Non-empty string arguments as-is; other non-null values as JSON text.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn save_memory_tool() -> ToolDefinition {
    ToolDefinition {
        name: SAVE_MEMORY_TOOL.to_string(),
        description: "Save the memory consolidation result to persistent storage.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "history_entry": {
                    "type": "string",
                    "description": "A paragraph (2-5 sentences) summarizing key events/decisions/topics. Start with [YYYY-MM-DD HH:MM]. Include detail useful for grep search."
                },
                "memory_update": {
                    "type": "string",
                    "description": "Full updated long-term memory as markdown. Include all existing facts plus new ones. Return unchanged if nothing new."
                }
            },
            "required": ["history_entry", "memory_update"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::providers::{ChatRole, ContentBlock, LlmResponse};
    use crate::session::SessionMessage;

    struct ScriptedProvider {
        tool_name: &'static str,
        reply: Option<Value>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedProvider {
        fn calling(args: Value) -> Self {
            Self::calling_tool(SAVE_MEMORY_TOOL, args)
        }

        fn calling_tool(tool_name: &'static str, args: Value) -> Self {
            Self {
                tool_name,
                reply: Some(args),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn silent() -> Self {
            Self {
                tool_name: SAVE_MEMORY_TOOL,
                reply: None,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn provider_id(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let content = match &self.reply {
                Some(input) => vec![ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: self.tool_name.into(),
                    input: input.clone(),
                }],
                None => vec![ContentBlock::Text {
                    text: "nothing to save".into(),
                }],
            };
            Ok(LlmResponse {
                content,
                model: "test".into(),
                usage: None,
                stop_reason: None,
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn session_with(count: usize) -> Session {
        let mut session = Session::new("dingtalk:u1");
        for i in 0..count {
            let role = if i % 2 == 0 {
                ChatRole::User
            } else {
                ChatRole::Assistant
            };
            session.push(SessionMessage::new(role, format!("message {i}")));
        }
        session
    }

    #[tokio::test]
    async fn daily_notes_get_header_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        assert_eq!(store.read_today().await.unwrap(), "");

        store.append_today("first").await.unwrap();
        store.append_today("second").await.unwrap();

        let today = Local::now().format("%Y-%m-%d");
        assert_eq!(
            store.read_today().await.unwrap(),
            format!("# {today}\n\nfirst\nsecond")
        );
        assert_eq!(
            store.get_recent_memories(7).await.unwrap(),
            store.read_today().await.unwrap()
        );
    }

    #[tokio::test]
    async fn memory_context_combines_sections() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get_memory_context().await.unwrap(), "");

        store.write_long_term("likes tea").await.unwrap();
        let context = store.get_memory_context().await.unwrap();
        assert_eq!(context, "## Long-term Memory\nlikes tea");

        store.append_today("met Bob").await.unwrap();
        let context = store.get_memory_context().await.unwrap();
        assert!(context.starts_with("## Long-term Memory\nlikes tea\n\n## Today's Notes\n# "));
        assert!(context.ends_with("met Bob"));
    }

    #[tokio::test]
    async fn history_entries_are_separated_by_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        store.append_history("one\n\n\n").await.unwrap();
        store.append_history("two").await.unwrap();

        let history = std::fs::read_to_string(store.memory_dir().join(HISTORY_FILE)).unwrap();
        assert_eq!(history, "one\n\ntwo\n\n");
    }

    #[tokio::test]
    async fn consolidate_keeps_recent_half_of_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        let provider = ScriptedProvider::calling(json!({
            "history_entry": "[2026-01-01 10:00] user chatted",
            "memory_update": "user likes tea"
        }));
        let mut session = session_with(12);

        assert!(store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert_eq!(session.last_consolidated, 7);
        assert_eq!(store.read_long_term().await.unwrap(), "user likes tea");

        let requests = provider.requests.lock().unwrap();
        let prompt = match &requests[0].messages[0].content {
            crate::providers::MessagePart::Text(t) => t.clone(),
            _ => panic!("expected text prompt"),
        };
        assert!(prompt.contains("## Current Long-term Memory\n(empty)"));
        assert!(prompt.contains("USER: message 0"));
        assert!(prompt.contains("ASSISTANT: message 6"));
        assert!(!prompt.contains("message 7"));
        assert_eq!(requests[0].tools[0].name, SAVE_MEMORY_TOOL);
    }

    #[tokio::test]
    async fn first_tool_call_is_used_whatever_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        let provider = ScriptedProvider::calling_tool(
            "saveMemory",
            json!({
                "history_entry": "[2026-01-01 10:00] renamed call",
                "memory_update": "user likes coffee"
            }),
        );
        let mut session = session_with(12);

        assert!(store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert_eq!(session.last_consolidated, 7);
        assert_eq!(store.read_long_term().await.unwrap(), "user likes coffee");
    }

    #[tokio::test]
    async fn consolidate_is_noop_when_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        let provider = ScriptedProvider::silent();
        let mut session = session_with(4);

        assert!(store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert!(provider.requests.lock().unwrap().is_empty());
        assert_eq!(session.last_consolidated, 0);
    }

    #[tokio::test]
    async fn archive_all_resets_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        let provider = ScriptedProvider::calling(json!({
            "history_entry": "summary",
            "memory_update": "facts"
        }));
        let mut session = session_with(3);

        assert!(store.consolidate(&mut session, &provider, "m", true, 50).await);
        assert_eq!(session.last_consolidated, 0);
        let history = std::fs::read_to_string(store.memory_dir().join(HISTORY_FILE)).unwrap();
        assert_eq!(history, "summary\n\n");
    }

    #[tokio::test]
    async fn consolidate_fails_without_tool_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        let provider = ScriptedProvider::silent();
        let mut session = session_with(12);

        assert!(!store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert_eq!(session.last_consolidated, 0);
    }

    #[tokio::test]
    async fn unchanged_memory_is_not_rewritten_and_string_args_parse() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        store.write_long_term("same").await.unwrap();
        let provider = ScriptedProvider::calling(Value::String(
            json!({"history_entry": {"topic": "tea"}, "memory_update": "same"}).to_string(),
        ));
        let mut session = session_with(12);

        assert!(store.consolidate(&mut session, &provider, "m", false, 10).await);
        assert_eq!(store.read_long_term().await.unwrap(), "same");
        let history = std::fs::read_to_string(store.memory_dir().join(HISTORY_FILE)).unwrap();
        assert_eq!(history, "{\"topic\":\"tea\"}\n\n");
    }
}
