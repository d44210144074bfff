//! Configuration loader and validator for the sync service.
use chrono::NaiveDate;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::catalog;
use crate::jsonapi::DEFAULT_API_BASE;

pub const ENV_BASE_URL: &str = "PRODUCTIVE_BASE_URL";
pub const ENV_TOKEN: &str = "PRODUCTIVE_API_TOKEN";
pub const ENV_ORGANIZATION_ID: &str = "PRODUCTIVE_ORGANIZATION_ID";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub app: App,
    pub api: Api,
    pub sync: SyncOptions,
    pub server: Server,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub data_dir: String,
    /// Overrides the `sqlite://{data_dir}/productive.db` default.
    pub database_url: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            database_url: None,
        }
    }
}

/// Upstream API credentials and transport settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Api {
    pub base_url: String,
    pub token: String,
    pub organization_id: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.into(),
            token: String::new(),
            organization_id: String::new(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_backoff_ms: 2000,
        }
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("organization_id", &self.organization_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

/// Sync run behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncOptions {
    pub lock_ttl_secs: u64,
    pub max_invalid_page_retries: u32,
    /// Kind names to sync; empty means every catalog kind.
    pub kinds: Vec<String>,
    /// Lower bound for time entries and their versions (`filter[after]`).
    pub time_entries_after: Option<NaiveDate>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 30 * 60,
            max_invalid_page_retries: 3,
            kinds: Vec::new(),
            time_entries_after: None,
        }
    }
}

/// Trigger/status HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
    pub bind: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        self.app
            .database_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/productive.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    /// Apply environment overrides through an injectable lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_BASE_URL) {
            self.api.base_url = v;
        }
        if let Some(v) = non_empty(ENV_TOKEN) {
            self.api.token = v;
        }
        if let Some(v) = non_empty(ENV_ORGANIZATION_ID) {
            self.api.organization_id = v;
        }
        if let Some(v) = non_empty(ENV_DATABASE_URL) {
            self.app.database_url = Some(v);
        }
    }
}

/// Load configuration from a YAML file, overlay the environment, and validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - A missing file falls back to defaults so env-only deployments work.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let mut cfg = if path.exists() {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)?
    } else {
        Config::default()
    };
    cfg.apply_env(|key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if Url::parse(&cfg.api.base_url).is_err() {
        return Err(ConfigError::Invalid(format!(
            "api.base_url is not a valid URL: {}",
            cfg.api.base_url
        )));
    }
    if cfg.api.token.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "api.token must be non-empty (or set {})",
            ENV_TOKEN
        )));
    }
    if cfg.api.organization_id.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "api.organization_id must be non-empty (or set {})",
            ENV_ORGANIZATION_ID
        )));
    }
    if cfg.api.timeout_secs == 0 {
        return Err(ConfigError::Invalid("api.timeout_secs must be > 0".into()));
    }
    if cfg.sync.lock_ttl_secs == 0 {
        return Err(ConfigError::Invalid("sync.lock_ttl_secs must be > 0".into()));
    }
    for kind in &cfg.sync.kinds {
        if catalog::find(kind).is_none() {
            return Err(ConfigError::Invalid(format!(
                "sync.kinds contains unknown kind '{}'",
                kind
            )));
        }
    }
    Ok(())
}

/// Returns a documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  # database_url: "sqlite://./data/productive.db"

api:
  base_url: "https://api.productive.io/api/v2/"
  token: "YOUR_API_TOKEN"
  organization_id: "YOUR_ORGANIZATION_ID"
  timeout_secs: 30
  max_attempts: 3
  retry_backoff_ms: 2000

sync:
  lock_ttl_secs: 1800
  max_invalid_page_retries: 3
  # empty = every kind, in dependency order
  kinds: []
  # time_entries_after: "2024-01-01"

server:
  bind: "127.0.0.1:8080"
"#
}
