//! Configuration data structures

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the bot token. The token is never read from the config file.
pub const BOT_TOKEN_ENV: &str = "RELAY_TELEGRAM_BOT_TOKEN";
/// Environment variable overriding `telegram.chat_id`.
pub const CHAT_ID_ENV: &str = "RELAY_TELEGRAM_CHAT_ID";

/// Errors from loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Logging level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// How a caller waits for an approval result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Await the resolution signal, raced against the deadline
    #[default]
    Signal,
    /// Check the result slot on a growing interval
    AdaptivePoll,
}

/// Telegram destination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// The one chat every message goes to and every callback must come from
    pub chat_id: Option<String>,
    /// Bot API base URL
    pub api_base: String,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_seconds: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            chat_id: None,
            api_base: "https://api.telegram.org".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl TelegramConfig {
    /// Chat id from the environment, falling back to the config file
    pub fn resolve_chat_id(&self) -> Option<String> {
        std::env::var(CHAT_ID_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.chat_id.clone().filter(|s| !s.trim().is_empty()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Notification batching settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Seconds normal-priority notifications accumulate before a flush
    pub window_seconds: u64,
    /// Maximum queued notifications before a forced flush
    pub max_queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_seconds: 5,
            max_queue_size: 20,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Outbound delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Total attempts per transport call, including the first
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on every further retry
    pub retry_base_delay_ms: u64,
    /// Calls allowed in any trailing rate limit window
    pub rate_limit_max_requests: usize,
    /// Length of the sliding rate limit window
    pub rate_limit_window_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            rate_limit_max_requests: 20,
            rate_limit_window_ms: 60_000,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

/// Approval coordinator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Maximum live approval requests
    pub max_concurrent: usize,
    /// Timeout used when the caller does not give one
    pub default_timeout_seconds: u64,
    pub wait_mode: WaitMode,
    /// Adaptive poll: first interval
    pub poll_floor_ms: u64,
    /// Adaptive poll: growth per unsuccessful check
    pub poll_step_ms: u64,
    /// Adaptive poll: interval ceiling
    pub poll_ceiling_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout_seconds: 300,
            wait_mode: WaitMode::Signal,
            poll_floor_ms: 100,
            poll_step_ms: 100,
            poll_ceiling_ms: 1000,
        }
    }
}

impl ApprovalConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Logging verbosity level
    pub log_level: LogLevel,
    pub telegram: TelegramConfig,
    pub batch: BatchConfig,
    pub delivery: DeliveryConfig,
    pub approvals: ApprovalConfig,
}

impl RelayConfig {
    /// Load configuration from file, or defaults when the file does not exist
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(RelayConfig::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save configuration to file, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, content).map_err(write_err)
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("relay").join("config.toml"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.telegram.api_base) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(_) => errors.push("telegram.api_base must be an http(s) URL".to_string()),
            Err(e) => errors.push(format!("telegram.api_base is not a valid URL: {}", e)),
        }
        if let Some(chat_id) = &self.telegram.chat_id {
            if chat_id.trim().is_empty() {
                errors.push("telegram.chat_id cannot be empty when set".to_string());
            }
        }
        if self.telegram.request_timeout_seconds == 0 {
            errors.push("telegram.request_timeout_seconds must be at least 1".to_string());
        }

        if self.batch.window_seconds == 0 || self.batch.window_seconds > 3600 {
            errors.push("batch.window_seconds must be between 1 and 3600".to_string());
        }
        if self.batch.max_queue_size == 0 || self.batch.max_queue_size > 1000 {
            errors.push("batch.max_queue_size must be between 1 and 1000".to_string());
        }

        if self.delivery.retry_attempts == 0 || self.delivery.retry_attempts > 10 {
            errors.push("delivery.retry_attempts must be between 1 and 10".to_string());
        }
        if self.delivery.rate_limit_max_requests == 0 {
            errors.push("delivery.rate_limit_max_requests must be at least 1".to_string());
        }
        if self.delivery.rate_limit_window_ms == 0 {
            errors.push("delivery.rate_limit_window_ms must be at least 1".to_string());
        }

        if self.approvals.max_concurrent == 0 || self.approvals.max_concurrent > 100 {
            errors.push("approvals.max_concurrent must be between 1 and 100".to_string());
        }
        if self.approvals.default_timeout_seconds == 0
            || self.approvals.default_timeout_seconds > 86_400
        {
            errors.push("approvals.default_timeout_seconds must be between 1 and 86400".to_string());
        }
        if self.approvals.poll_floor_ms == 0 {
            errors.push("approvals.poll_floor_ms must be at least 1".to_string());
        }
        if self.approvals.poll_ceiling_ms < self.approvals.poll_floor_ms {
            errors.push("approvals.poll_ceiling_ms cannot be below poll_floor_ms".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
