use std::path::{Path, PathBuf};

use dingcrust_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, DingTalkConfig};

const CONFIG_FILE_NAMES: [&str; 3] = ["config.yaml", "config.yml", "config.toml"];

/// Locates, parses and post-processes the application configuration.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at `~/.dingcrust`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".into()))?;
        Ok(Self {
            config_dir: home.join(".dingcrust"),
        })
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load the first config file found in the config directory, falling back
    /// to defaults, then apply environment overrides and validate.
    pub fn load(&self) -> Result<AppConfig> {
        let _ = dotenvy::dotenv();

        let mut config = match self.find_config_file() {
            Some(path) => Self::parse_file(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit config file, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let _ = dotenvy::dotenv();
        let mut config = Self::parse_file(path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|path| path.is_file())
    }

    pub fn parse_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid toml in {}: {e}", path.display())))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("invalid yaml in {}: {e}", path.display())))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Overlay credentials and model settings from the environment.
    ///
    /// `lookup` abstracts `std::env::var` so callers can supply any source.
    pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
        let client_id = lookup("DINGTALK_CLIENT_ID");
        let client_secret = lookup("DINGTALK_CLIENT_SECRET");
        if client_id.is_some() || client_secret.is_some() {
            let dingtalk = config
                .channels
                .dingtalk
                .get_or_insert_with(DingTalkConfig::default);
            if let Some(id) = client_id {
                dingtalk.client_id = id;
            }
            if let Some(secret) = client_secret {
                dingtalk.client_secret = secret;
            }
        }

        if let Some(key) = lookup("DINGCRUST_LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("DINGCRUST_LLM_BASE_URL") {
            config.llm.base_url = Some(url);
        }
        if let Some(model) = lookup("DINGCRUST_MODEL") {
            config.agent.model = model;
        }
    }
}
