//! Persistent configuration for the plansync CLI.
//!
//! Config file lives at `~/.config/plansync/cli.toml`. Every field is
//! optional; command-line flags override the file, and anything still unset
//! falls back to the SDK defaults.

use std::path::PathBuf;
use std::time::Duration;

use plansync_sdk::SyncConfig;
use serde::{Deserialize, Serialize};

/// User configuration (persisted in cli.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker URL (mqtt://, mqtts://; unknown schemes run detached).
    pub broker_url: Option<String>,
    /// Broker username.
    pub broker_username: Option<String>,
    /// Broker password.
    pub broker_password: Option<String>,
    /// Base URL of the record service.
    pub api_url: Option<String>,
    /// Client id prefix; a random suffix is appended per process.
    pub client_id_prefix: Option<String>,
    /// Seconds between reconnect attempts.
    pub reconnect_period_secs: Option<u64>,
    /// Reconnect attempts before degrading to detached mode.
    pub max_reconnect_attempts: Option<u32>,
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plansync")
        .join("cli.toml")
}

impl Config {
    pub fn load() -> Self {
        let path = config_path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => return c,
                    Err(e) => eprintln!("Warning: bad config file {}: {e}", path.display()),
                },
                Err(e) => eprintln!("Warning: can't read {}: {e}", path.display()),
            }
        }
        Self::default()
    }

    /// Fold the file-level settings into an SDK config. Fields the file does
    /// not set keep the SDK defaults.
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::default();
        if let Some(url) = &self.broker_url {
            config.broker_url = url.clone();
        }
        config.username = self.broker_username.clone();
        config.password = self.broker_password.clone();
        if let Some(prefix) = &self.client_id_prefix {
            config.client_id_prefix = prefix.clone();
        }
        if let Some(secs) = self.reconnect_period_secs {
            config.reconnect_period = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }
        config
    }
}
