//! Relay configuration
//!
//! Loaded from `config.toml` inside the relay directory. Every field has a
//! default so a partial file (or none at all) is valid. Environment variables
//! override the file; CLI flags override both.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub health: HealthConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Common prefix for every API route
    pub prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            prefix: "/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Explicit database file; defaults to `relay.db` in the relay directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub stale_connection_minutes: i64,
    pub stale_app_minutes: i64,
    pub max_pending_updates: u64,
    pub max_errors_per_hour: u64,
    /// Processed updates and sync rows older than this are reaped
    pub retention_minutes: i64,
    /// Error logs live `retention_minutes * error_retention_factor`
    pub error_retention_factor: i64,
    pub reap_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_connection_minutes: 30,
            stale_app_minutes: 5,
            max_pending_updates: 1_000,
            max_errors_per_hour: 50,
            retention_minutes: 60,
            error_retention_factor: 24,
            reap_interval_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Cadence and retry bounds for the adaptive poll client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_factor: f64,
    /// Consecutive transport failures tolerated before re-registering
    pub failure_threshold: u32,
    pub max_reconnect_attempts: u32,
    pub batch_size: usize,
    pub broadcast_max_attempts: u32,
    pub broadcast_initial_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_000,
            max_interval_ms: 30_000,
            backoff_factor: 1.5,
            failure_threshold: 3,
            max_reconnect_attempts: 3,
            batch_size: 50,
            broadcast_max_attempts: 3,
            broadcast_initial_delay_ms: 500,
            request_timeout_secs: 10,
        }
    }
}

impl PollConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn broadcast_policy(&self) -> crate::error::RetryPolicy {
        crate::error::RetryPolicy {
            max_attempts: self.broadcast_max_attempts.max(1),
            initial_delay: Duration::from_millis(self.broadcast_initial_delay_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Write a daily rolling log file into `logs/` under the relay directory
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "dx_relay=info,tower_http=warn".to_string(),
            file: false,
        }
    }
}

impl RelayConfig {
    /// Load `config.toml` from the relay directory, falling back to defaults
    /// when the file does not exist, then apply environment overrides.
    pub fn load(relay_path: &Path) -> Result<Self> {
        let config_path = relay_path.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::from_toml(&text)
                .with_context(|| format!("invalid config in {}", config_path.display()))?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// `DX_RELAY_PORT`, `DX_RELAY_DB` and `DX_RELAY_RETENTION_MINUTES`, read
    /// after loading any `.env` file.
    pub fn apply_env(&mut self) -> Result<()> {
        dotenvy::dotenv().ok();

        if let Ok(port) = std::env::var("DX_RELAY_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("DX_RELAY_PORT is not a port: {port}"))?;
        }
        if let Ok(path) = std::env::var("DX_RELAY_DB") {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Ok(minutes) = std::env::var("DX_RELAY_RETENTION_MINUTES") {
            self.health.retention_minutes = minutes
                .parse()
                .with_context(|| format!("DX_RELAY_RETENTION_MINUTES is not a number: {minutes}"))?;
        }
        Ok(())
    }

    /// Database file for a relay rooted at `relay_path`.
    pub fn db_path(&self, relay_path: &Path) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| relay_path.join(crate::storage::db::DB_FILE))
    }
}
