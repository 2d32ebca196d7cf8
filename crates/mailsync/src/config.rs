//! Configuration loading for the sync service
//!
//! Settings are resolved in this order (later wins):
//! 1. Built-in defaults
//! 2. JSON file (~/.config/mailsync/mailsync.json, or an explicit path)
//! 3. Environment variables (MAILSYNC_*)
//!
//! Validation failures are fatal at startup and never once the loop runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::sync::{SchedulerOptions, SyncOptions};

/// Config filename in the mailsync config directory
const CONFIG_FILE: &str = "mailsync.json";

/// Default database filename in the mailsync config directory
const DATABASE_FILE: &str = "mail.sqlite";

/// Environment variable holding the Gmail bearer token
pub const ACCESS_TOKEN_ENV: &str = "GMAIL_ACCESS_TOKEN";

/// A configuration problem found at startup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("poll interval must be at least one second")]
    ZeroInterval,
    #[error("max_results must be greater than zero when set")]
    ZeroMaxResults,
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: String, value: String },
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("could not determine a database path; set MAILSYNC_DATABASE_PATH")]
    NoDatabasePath,
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between poll cycles
    pub poll_interval_secs: u64,
    /// Cap on messages per fetch
    pub max_results: Option<usize>,
    /// Provider search filter
    pub query: String,
    /// SQLite database location (None = config directory default)
    pub database_path: Option<PathBuf>,
    /// Processed flag given to newly ingested messages
    pub processed_on_ingest: bool,
    /// Failed upserts before a message is quarantined (0 = never)
    pub max_persist_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_results: None,
            query: String::new(),
            database_path: None,
            processed_on_ingest: false,
            max_persist_attempts: 5,
        }
    }
}

impl SyncConfig {
    /// Load from the default config file (if present) and the process environment
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific JSON file and the process environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = config::load_json_file(path)?;
        cfg.apply_env(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse settings from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse mailsync config JSON")
    }

    /// Override fields from environment variables read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "MAILSYNC_POLL_INTERVAL_SECS")? {
            self.poll_interval_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILSYNC_MAX_RESULTS")? {
            self.max_results = Some(v);
        }
        if let Some(v) = lookup("MAILSYNC_QUERY") {
            self.query = v;
        }
        if let Some(v) = lookup("MAILSYNC_DATABASE_PATH").filter(|v| !v.is_empty()) {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_env(&lookup, "MAILSYNC_PROCESSED_ON_INGEST")? {
            self.processed_on_ingest = v;
        }
        if let Some(v) = parse_env(&lookup, "MAILSYNC_MAX_PERSIST_ATTEMPTS")? {
            self.max_persist_attempts = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.max_results == Some(0) {
            return Err(ConfigError::ZeroMaxResults);
        }
        Ok(())
    }

    /// Where the SQLite database lives
    pub fn resolved_database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => config::config_path(DATABASE_FILE).ok_or(ConfigError::NoDatabasePath),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        let query = self.query.trim();
        SyncOptions {
            max_results: self.max_results,
            query: (!query.is_empty()).then(|| query.to_string()),
            processed_on_ingest: self.processed_on_ingest,
            max_persist_attempts: self.max_persist_attempts,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions::every(self.poll_interval())
    }

    /// Write these settings as JSON, to `path` or the default config file
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        match path {
            Some(path) => {
                config::save_json_file(path, self)?;
                Ok(path.to_path_buf())
            }
            None => {
                config::save_json(CONFIG_FILE, self)?;
                Self::default_config_path().context("Could not determine config directory")
            }
        }
    }

    /// Get the default config file path (~/.config/mailsync/mailsync.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }
}

/// Read the Gmail access token from the environment
pub fn access_token_from_env() -> Result<String, ConfigError> {
    std::env::var(ACCESS_TOKEN_ENV)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(ACCESS_TOKEN_ENV))
}

fn parse_env<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value: raw,
            }),
    }
}
