//! Configuration loading and persistence.
//!
//! Settings live in a JSON file under the platform config directory
//! (override with `OPWATCH_CONFIG_DIR`); the server URL can additionally
//! be overridden per invocation with `OPWATCH_SERVER_URL` or the CLI flag.
//! A missing file means defaults — the file is only written on demand.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;

/// Recommended fixed delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
/// Recommended heart-beat interval, both directions.
pub const DEFAULT_HEARTBEAT_MS: u64 = 4000;

/// Configuration for the opwatch CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the progress server.
    pub server_url: String,
    /// Fixed delay in seconds between reconnect attempts.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Heart-beat interval in milliseconds offered in both directions;
    /// zero disables heart-beats.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
}

fn default_reconnect_delay() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

fn default_heartbeat() -> u64 {
    DEFAULT_HEARTBEAT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
        }
    }
}

impl Config {
    /// Configuration directory: `OPWATCH_CONFIG_DIR` if set, otherwise the
    /// platform config dir plus `opwatch`.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("OPWATCH_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("could not determine config directory")?
            .join("opwatch"))
    }

    /// Path of the config file.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load configuration, applying env overrides. Missing file = defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(url) = std::env::var("OPWATCH_SERVER_URL") {
            config.server_url = url;
        }
        Ok(config)
    }

    /// Load from an explicit path, falling back to defaults when absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid config at {}", path.display()))
    }

    /// Persist to the default location, creating the directory if needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Persist to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config to {}", path.display()))
    }

    /// Connection parameters derived from this config.
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            &self.server_url,
            Duration::from_secs(self.reconnect_delay_secs),
            self.heartbeat_ms,
        )
    }
}
