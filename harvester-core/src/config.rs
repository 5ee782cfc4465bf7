//! Application configuration.
//!
//! Settings come from an optional TOML file; credentials and connection strings
//! can be overridden from the environment so they never have to live on disk.

use crate::error::ConfigError;
use crate::types::KeywordMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use url::Url;

pub const ENV_API_ID: &str = "TELEGRAM_API_ID";
pub const ENV_API_HASH: &str = "TELEGRAM_API_HASH";
pub const ENV_PHONE: &str = "TELEGRAM_PHONE";
pub const ENV_GATEWAY_URL: &str = "TELEGRAM_GATEWAY_URL";
pub const ENV_DATABASE_URL: &str = "HARVESTER_DATABASE_URL";

/// Upper bound of one replies page on the Telegram side.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Largest number of posts a single run may check.
pub const MAX_POSTS_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub pacing: PacingConfig,
    pub retry: RetrySettings,
    pub registry: RegistrySettings,
    pub defaults: RunDefaults,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub phone: Option<String>,
    /// Base URL of the HTTP gateway in front of the Telegram client API
    pub gateway_url: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub requests_per_minute: u32,
    pub comments_page_size: u32,
    /// Ceiling on comments fetched for a single post
    pub max_comments_per_post: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_id: None,
            api_hash: None,
            phone: None,
            gateway_url: "http://127.0.0.1:8081".to_string(),
            user_agent: format!("comment-harvester/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            requests_per_minute: 30,
            comments_page_size: MAX_PAGE_SIZE,
            max_comments_per_post: 10_000,
        }
    }
}

/// Deliberate pauses between posts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub post_delay_ms: u64,
    /// Posts returning more comments than this get the extra delay too
    pub heavy_post_threshold: usize,
    pub heavy_post_extra_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            post_delay_ms: 1000,
            heavy_post_threshold: 100,
            heavy_post_extra_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub max_finished_runs: usize,
    pub finished_run_ttl_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_finished_runs: 100,
            finished_run_ttl_secs: 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunDefaults {
    pub posts_limit: u32,
    pub keyword_mode: KeywordMode,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            posts_limit: 30,
            keyword_mode: KeywordMode::Any,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: String,
}

impl fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("phone", &self.phone)
            .finish()
    }
}

impl AppConfig {
    /// Load from `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        tracing::debug!(?path, "Configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_id) = lookup(ENV_API_ID) {
            let parsed = api_id
                .trim()
                .parse::<i32>()
                .map_err(|_| ConfigError::InvalidValue {
                    field: ENV_API_ID.to_string(),
                    value: api_id.clone(),
                })?;
            self.telegram.api_id = Some(parsed);
        }
        if let Some(api_hash) = lookup(ENV_API_HASH) {
            self.telegram.api_hash = Some(api_hash);
        }
        if let Some(phone) = lookup(ENV_PHONE) {
            self.telegram.phone = Some(phone);
        }
        if let Some(gateway_url) = lookup(ENV_GATEWAY_URL) {
            self.telegram.gateway_url = gateway_url;
        }
        if let Some(database_url) = lookup(ENV_DATABASE_URL) {
            self.database_url = Some(database_url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credentials()?;

        Url::parse(&self.telegram.gateway_url).map_err(|_| ConfigError::InvalidValue {
            field: "telegram.gateway_url".to_string(),
            value: self.telegram.gateway_url.clone(),
        })?;

        if self.telegram.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telegram.request_timeout_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.telegram.requests_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                field: "telegram.requests_per_minute".to_string(),
                value: "0".to_string(),
            });
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.telegram.comments_page_size) {
            return Err(ConfigError::InvalidValue {
                field: "telegram.comments_page_size".to_string(),
                value: self.telegram.comments_page_size.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::ValidationFailed {
                reason: "retry.jitter_factor must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationFailed {
                reason: "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            });
        }
        if !(1..=MAX_POSTS_LIMIT).contains(&self.defaults.posts_limit) {
            return Err(ConfigError::InvalidValue {
                field: "defaults.posts_limit".to_string(),
                value: self.defaults.posts_limit.to_string(),
            });
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<TelegramCredentials, ConfigError> {
        let api_id = self.telegram.api_id.ok_or_else(|| ConfigError::MissingField {
            field: "telegram.api_id".to_string(),
        })?;
        let api_hash = non_blank(&self.telegram.api_hash).ok_or_else(|| {
            ConfigError::MissingField {
                field: "telegram.api_hash".to_string(),
            }
        })?;
        let phone = non_blank(&self.telegram.phone).ok_or_else(|| ConfigError::MissingField {
            field: "telegram.phone".to_string(),
        })?;

        Ok(TelegramCredentials {
            api_id,
            api_hash,
            phone,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
