use std::path::PathBuf;
use std::time::Duration;

use dingcrust_common::{Error, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DINGTALK_API: &str = "https://api.dingtalk.com";
pub const DEFAULT_CARD_TEMPLATE_ID: &str = "382e4302-551d-4880-bf29-a30acfab2e71.schema";

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub channels: ChannelsConfig,
    pub agent: AgentConfig,
    pub llm: LlmProviderConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(dingtalk) = &self.channels.dingtalk
            && dingtalk.enabled
        {
            dingtalk.validate()?;
        }
        if self.agent.memory_window < 2 {
            return Err(Error::Config("agent.memory_window must be at least 2".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub dingtalk: Option<DingTalkConfig>,
}

/// How replies are rendered on DingTalk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// One markdown message per reply or progress update.
    #[default]
    Text,
    /// An interactive AI card updated in place with a typewriter effect.
    AiCard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkConfig {
    pub enabled: bool,
    /// App key of the DingTalk robot; doubles as the robot code.
    pub client_id: String,
    pub client_secret: String,
    pub reply_mode: ReplyMode,
    pub card_template_id: String,
    /// Sender ids permitted to talk to the agent. Empty allows everyone.
    pub allow_from: Vec<String>,
    pub api_base_url: String,
    pub card_ttl_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Upper bound on one OpenAPI request or gateway connect.
    pub request_timeout_secs: u64,
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: String::new(),
            client_secret: String::new(),
            reply_mode: ReplyMode::Text,
            card_template_id: DEFAULT_CARD_TEMPLATE_ID.to_string(),
            allow_from: Vec::new(),
            api_base_url: DEFAULT_DINGTALK_API.to_string(),
            card_ttl_secs: 600,
            shutdown_timeout_secs: 10,
            reconnect_delay_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

impl DingTalkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("dingtalk client_id is required".into()));
        }
        if self.client_secret.trim().is_empty() {
            return Err(Error::Config("dingtalk client_secret is required".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "dingtalk request_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn card_ttl(&self) -> Duration {
        Duration::from_secs(self.card_ttl_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory holding the agent's `memory/` folder.
    pub workspace: PathBuf,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    /// Number of session messages kept in context before consolidation.
    pub memory_window: usize,
    /// Progress text shown while the agent works on a reply.
    pub progress_text: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let workspace = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dingcrust")
            .join("workspace");
        Self {
            workspace,
            model: "gpt-4o-mini".to_string(),
            system_prompt: None,
            max_tokens: None,
            memory_window: 50,
            progress_text: Some("Thinking...".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dingtalk_defaults_match_card_protocol() {
        let config = DingTalkConfig::default();
        assert_eq!(config.reply_mode, ReplyMode::Text);
        assert_eq!(config.card_ttl(), Duration::from_secs(600));
        assert_eq!(config.api_base_url, DEFAULT_DINGTALK_API);
        assert_eq!(config.card_template_id, DEFAULT_CARD_TEMPLATE_ID);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_request_timeout_is_rejected() {
        let config = DingTalkConfig {
            client_id: "ding-app".into(),
            client_secret: "s3cret".into(),
            request_timeout_secs: 0,
            ..Default::default()
        };
        let err = config.validate().expect_err("zero timeout should fail");
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn enabled_dingtalk_requires_credentials() {
        let mut config = AppConfig::default();
        config.channels.dingtalk = Some(DingTalkConfig {
            client_id: "ding-app".into(),
            ..Default::default()
        });

        let err = config.validate().expect_err("missing secret should fail");
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn disabled_dingtalk_skips_validation() {
        let mut config = AppConfig::default();
        config.channels.dingtalk = Some(DingTalkConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reply_mode_uses_snake_case() {
        let mode: ReplyMode = serde_json::from_str("\"ai_card\"").unwrap();
        assert_eq!(mode, ReplyMode::AiCard);
    }
}
