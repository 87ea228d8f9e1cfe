//! Configuration management for Postline
//!
//! Every section is optional in the TOML file; missing sections and fields
//! take the defaults below. A missing config file is not an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

pub const CONFIG_ENV: &str = "POSTLINE_CONFIG";
pub const DB_PATH_ENV: &str = "POSTLINE_DB_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub publish: PublishConfig,
    pub sessions: SessionsConfig,
    pub rate_limits: RateLimitConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/postline/postline.db".to_string(),
        }
    }
}

/// Dispatcher timing, retry and concurrency knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub recovery_interval_secs: u64,
    /// A processing claim older than this is considered abandoned
    pub stale_after_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Upper bound on account batches worked at once
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            recovery_interval_secs: 300,
            stale_after_secs: 900,
            max_attempts: 3,
            backoff_base_secs: 60,
            backoff_max_secs: 3600,
            max_concurrent: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    pub carousel_min: usize,
    pub carousel_max: usize,
    pub max_caption_chars: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            carousel_min: 2,
            carousel_max: 10,
            max_caption_chars: 2200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Mixed into device fingerprints; changing it changes every new fingerprint
    pub fingerprint_salt: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            fingerprint_salt: "postline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Publishes allowed per account per clock hour; 0 disables the limit
    pub posts_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { posts_per_hour: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub media_root: String,
    pub credentials_file: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8808".to_string(),
            timeout_secs: 60,
            media_root: "~/.local/share/postline/media".to_string(),
            credentials_file: "~/.config/postline/credentials.toml".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Falls back to defaults when no file exists there, then applies
    /// `POSTLINE_DB_PATH`.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.trim().is_empty() {
                self.database.path = path;
            }
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(invalid("scheduler.poll_interval_secs", "must be at least 1").into());
        }
        if self.scheduler.max_attempts == 0 {
            return Err(invalid("scheduler.max_attempts", "must be at least 1").into());
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(invalid("scheduler.max_concurrent", "must be at least 1").into());
        }
        if self.scheduler.backoff_max_secs < self.scheduler.backoff_base_secs {
            return Err(invalid(
                "scheduler.backoff_max_secs",
                "must not be smaller than backoff_base_secs",
            )
            .into());
        }
        if self.publish.carousel_min < 2 || self.publish.carousel_min > self.publish.carousel_max {
            return Err(invalid(
                "publish.carousel_min",
                "must be at least 2 and not above carousel_max",
            )
            .into());
        }
        Ok(())
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database.path)
    }
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(expand_path(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("postline").join("config.toml"))
}
