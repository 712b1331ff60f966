use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use vendorchat_core::config::CoreConfig;
use vendorchat_core::policy::Policy;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9180".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

/// Conversations preloaded into the in-memory transport at boot.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedConfig {
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedConversation {
    pub id: String,
    pub participant: String,
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("invalid {0}")]
    Invalid(String),
}

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let addr: SocketAddr = self
            .api
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("api.bind_addr".to_string()))?;
        if !addr.ip().is_loopback() {
            return Err(ConfigError::Invalid(
                "api.bind_addr must be a loopback address".to_string(),
            ));
        }
        if !LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::Invalid("logging.level".to_string()));
        }
        let policy = &self.policy;
        if policy.max_send_attempts == 0 {
            return Err(ConfigError::Invalid("policy.max_send_attempts".to_string()));
        }
        if policy.backoff_factor == 0 {
            return Err(ConfigError::Invalid("policy.backoff_factor".to_string()));
        }
        if policy.backoff_initial_ms > policy.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "policy.backoff_initial_ms exceeds backoff_max_ms".to_string(),
            ));
        }
        if policy.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("policy.max_body_bytes".to_string()));
        }
        if self.core.event_capacity == 0 {
            return Err(ConfigError::Invalid("core.event_capacity".to_string()));
        }
        let mut seen = HashSet::new();
        for conversation in &self.seed.conversations {
            if conversation.id.trim().is_empty() {
                return Err(ConfigError::Invalid("seed conversation id".to_string()));
            }
            if !seen.insert(conversation.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate seed conversation {}",
                    conversation.id
                )));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    toml::from_str(&content).map_err(|_| ConfigError::Parse)
}
