//! Postlater configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PostlaterError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostlaterConfig {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl PostlaterConfig {
    /// Load config from the default path (~/.postlater/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a specific path. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PostlaterError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PostlaterError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| PostlaterError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `SLACK_CLIENT_ID` / `SLACK_CLIENT_SECRET` take precedence over the file.
    pub fn apply_env(&mut self) {
        if let Ok(id) = std::env::var("SLACK_CLIENT_ID") {
            self.slack.client_id = id;
        }
        if let Ok(secret) = std::env::var("SLACK_CLIENT_SECRET") {
            self.slack.client_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(PostlaterError::Config(
                "scheduler.tick_secs must be at least 1".into(),
            ));
        }
        if self.slack.api_base.trim().is_empty() {
            return Err(PostlaterError::Config("slack.api_base is empty".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Postlater home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".postlater")
    }
}

/// Slack app credentials and API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Timeout for the refresh exchange. Message sends are not timed out.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { "https://slack.com/api".into() }
fn default_request_timeout() -> u64 { 30 }

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SlackConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Background delivery loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Deliver the due messages of one tick concurrently instead of one by one.
    #[serde(default = "bool_true")]
    pub concurrent_dispatch: bool,
    #[serde(default = "bool_true")]
    pub start_on_boot: bool,
}

fn default_tick_secs() -> u64 { 60 }
fn bool_true() -> bool { true }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            concurrent_dispatch: true,
            start_on_boot: true,
        }
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.postlater/postlater.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PostlaterConfig::default();
        assert_eq!(config.scheduler.tick_secs, 60);
        assert!(config.scheduler.concurrent_dispatch);
        assert_eq!(config.slack.api_base, "https://slack.com/api");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: PostlaterConfig = toml::from_str(
            r#"
            [scheduler]
            tick_secs = 5

            [slack]
            client_id = "123.456"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.tick_secs, 5);
        assert!(config.scheduler.start_on_boot);
        assert_eq!(config.slack.client_id, "123.456");
        assert_eq!(config.slack.request_timeout_secs, 30);
        assert_eq!(config.database.path, "~/.postlater/postlater.db");
    }

    #[test]
    fn test_zero_tick_rejected() {
        let mut config = PostlaterConfig::default();
        config.scheduler.tick_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = PostlaterConfig::default();
        config.scheduler.tick_secs = 15;
        config.save_to(&path).unwrap();

        let loaded = PostlaterConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.tick_secs, 15);
    }
}
