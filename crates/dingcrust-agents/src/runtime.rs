use std::sync::Arc;

use dingcrust_common::{InboundMessage, MessageBus, OutboundMessage, Result};
use dingcrust_config::AgentConfig;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::memory::MemoryStore;
use crate::providers::{ChatMessage, ChatRole, LlmProvider, LlmRequest};
use crate::session::{SessionManager, SessionMessage};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant talking to people through DingTalk. Answer concisely in markdown.";
const RESET_COMMAND: &str = "/new";

/// Consumes inbound messages, asks the LLM for a reply and publishes it.
pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    memory: MemoryStore,
    config: AgentConfig,
    sessions: Mutex<SessionManager>,
}

impl AgentRuntime {
    pub fn new(provider: Arc<dyn LlmProvider>, memory: MemoryStore, config: AgentConfig) -> Self {
        Self {
            provider,
            memory,
            config,
            sessions: Mutex::new(SessionManager::new()),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Run until `stop` fires or the bus closes. Messages are handled one at a time.
    pub async fn run(&self, bus: Arc<MessageBus>, stop: CancellationToken) {
        info!("agent: loop started (model {})", self.config.model);
        loop {
            let inbound = tokio::select! {
                _ = stop.cancelled() => break,
                next = bus.consume_inbound() => match next {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(e) = self.handle(&bus, &inbound).await {
                error!("agent: failed to handle message from {}: {e}", inbound.sender_id);
                let reply = OutboundMessage::reply_to(
                    &inbound,
                    "Sorry, something went wrong while answering.",
                );
                if let Err(e) = bus.publish_outbound(reply).await {
                    warn!("agent: could not publish error reply: {e}");
                }
            }
        }
        info!("agent: loop stopped");
    }

    #[instrument(skip_all, fields(session = %inbound.session_key()))]
    async fn handle(&self, bus: &MessageBus, inbound: &InboundMessage) -> Result<()> {
        if let Some(progress) = &self.config.progress_text {
            bus.publish_outbound(OutboundMessage::progress_for(inbound, progress.clone()))
                .await?;
        }
        let reply = self.respond(inbound).await?;
        bus.publish_outbound(OutboundMessage::reply_to(inbound, reply))
            .await
    }

    /// Produce the final reply text for `inbound`, updating its session.
    pub async fn respond(&self, inbound: &InboundMessage) -> Result<String> {
        let key = inbound.session_key();
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_or_create(&key);

        if inbound.content.trim() == RESET_COMMAND {
            if !self
                .memory
                .consolidate(
                    session,
                    self.provider.as_ref(),
                    &self.config.model,
                    true,
                    self.config.memory_window,
                )
                .await
            {
                warn!("agent: archiving {key} before reset failed");
            }
            session.clear();
            return Ok("New session started.".to_string());
        }

        let mut messages = session.history(self.config.memory_window);
        messages.push(ChatMessage::user(inbound.content.clone()));

        let mut request = LlmRequest::new(self.config.model.clone(), messages);
        request.system = Some(self.system_prompt().await?);
        request.max_tokens = self.config.max_tokens;
        let response = self.provider.complete(&request).await?;
        let reply = response.text();

        session.push(SessionMessage::new(ChatRole::User, inbound.content.clone()));
        session.push(SessionMessage::new(ChatRole::Assistant, reply.clone()));

        if session.unconsolidated() > self.config.memory_window
            && !self
                .memory
                .consolidate(
                    session,
                    self.provider.as_ref(),
                    &self.config.model,
                    false,
                    self.config.memory_window,
                )
                .await
        {
            warn!("agent: memory consolidation for {key} did not complete");
        }
        Ok(reply)
    }

    async fn system_prompt(&self) -> Result<String> {
        let base = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let context = self.memory.get_memory_context().await?;
        if context.is_empty() {
            Ok(base.to_string())
        } else {
            Ok(format!("{base}\n\n# Memory\n\n{context}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::providers::{ContentBlock, LlmResponse};

    struct EchoProvider {
        requests: StdMutex<Vec<LlmRequest>>,
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn provider_id(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(LlmResponse {
                content: vec![ContentBlock::Text {
                    text: format!("echo {}", request.messages.len()),
                }],
                model: "echo".into(),
                usage: None,
                stop_reason: Some("stop".into()),
            })
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    async fn runtime(dir: &std::path::Path) -> (AgentRuntime, Arc<EchoProvider>) {
        let provider = Arc::new(EchoProvider {
            requests: StdMutex::new(Vec::new()),
        });
        let memory = MemoryStore::open(dir).await.unwrap();
        let config = AgentConfig {
            workspace: dir.to_path_buf(),
            model: "test-model".into(),
            ..Default::default()
        };
        (
            AgentRuntime::new(provider.clone(), memory, config),
            provider,
        )
    }

    #[tokio::test]
    async fn publishes_progress_then_final_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _) = runtime(dir.path()).await;
        let bus = Arc::new(MessageBus::new());
        let stop = CancellationToken::new();

        bus.publish_inbound(InboundMessage::new("dingtalk", "u1", "u1", "hello"))
            .await
            .unwrap();

        let runtime = Arc::new(runtime);
        let handle = {
            let runtime = Arc::clone(&runtime);
            let bus = Arc::clone(&bus);
            let stop = stop.clone();
            tokio::spawn(async move { runtime.run(bus, stop).await })
        };

        let progress = bus.consume_outbound().await.unwrap();
        assert!(progress.is_progress());
        assert_eq!(progress.content, "Thinking...");

        let reply = bus.consume_outbound().await.unwrap();
        assert!(!reply.is_progress());
        assert_eq!(reply.content, "echo 1");
        assert_eq!(reply.chat_id, "u1");

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn history_and_memory_feed_the_request() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, provider) = runtime(dir.path()).await;
        runtime.memory().write_long_term("likes tea").await.unwrap();

        let first = InboundMessage::new("dingtalk", "u1", "u1", "hi");
        let second = InboundMessage::new("dingtalk", "u1", "u1", "again");
        assert_eq!(runtime.respond(&first).await.unwrap(), "echo 1");
        assert_eq!(runtime.respond(&second).await.unwrap(), "echo 3");

        let requests = provider.requests.lock().unwrap();
        let system = requests[1].system.as_deref().unwrap();
        assert!(system.contains("## Long-term Memory\nlikes tea"));
        assert_eq!(requests[1].model, "test-model");
    }

    #[tokio::test]
    async fn reset_command_clears_session() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _) = runtime(dir.path()).await;

        runtime
            .respond(&InboundMessage::new("dingtalk", "u1", "u1", "hi"))
            .await
            .unwrap();
        let reply = runtime
            .respond(&InboundMessage::new("dingtalk", "u1", "u1", "/new"))
            .await
            .unwrap();
        assert_eq!(reply, "New session started.");
        assert_eq!(
            runtime
                .respond(&InboundMessage::new("dingtalk", "u1", "u1", "fresh"))
                .await
                .unwrap(),
            "echo 1"
        );
    }
}
