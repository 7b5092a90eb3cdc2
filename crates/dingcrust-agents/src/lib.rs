pub mod memory;
pub mod openai;
pub mod providers;
pub mod runtime;
pub mod session;

pub use memory::MemoryStore;
pub use openai::OpenAiProvider;
pub use providers::{
    ChatMessage, ChatRole, ContentBlock, LlmProvider, LlmRequest, LlmResponse, MessagePart,
    ToolDefinition, Usage,
};
pub use runtime::AgentRuntime;
pub use session::{Session, SessionManager, SessionMessage};
