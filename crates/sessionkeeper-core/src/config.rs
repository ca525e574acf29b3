//! Session configuration.
//!
//! Holds the issuing service location, the retry policy applied to every
//! authenticated request and the keychain service name.
//!
//! Configuration is stored at `~/.config/sessionkeeper/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config directory paths
const APP_NAME: &str = "sessionkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Retry budget per request. A request is sent at most `max_retries + 1` times.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fixed wait before every resend
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub issue_path: String,
    pub reissue_path: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub keyring_service: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.invalid".to_string(),
            issue_path: "/auth/token".to_string(),
            reissue_path: "/auth/token/reissue".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            keyring_service: APP_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from `SESSIONKEEPER_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SESSIONKEEPER_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(value) = std::env::var("SESSIONKEEPER_MAX_RETRIES") {
            self.max_retries = value
                .parse()
                .context("SESSIONKEEPER_MAX_RETRIES must be a non-negative integer")?;
        }
        if let Ok(value) = std::env::var("SESSIONKEEPER_RETRY_DELAY_MS") {
            self.retry_delay_ms = value
                .parse()
                .context("SESSIONKEEPER_RETRY_DELAY_MS must be a non-negative integer")?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Join the base URL and a path with exactly one slash between them
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
