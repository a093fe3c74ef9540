//! Configuration parsing and management.
//!
//! One TOML file configures a deployment: a `[daemon]` section for the
//! reconciliation service and a `[station]` section for an operator
//! station. Each process reads its own section and ignores the other, so
//! a single file can describe a whole venue.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::BackoffConfig;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed configuration is invalid.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsherConfig {
    /// Reconciliation daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Operator station settings.
    #[serde(default)]
    pub station: StationConfig,
}

impl UsherConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.rate_limit_window.is_zero() {
            return Err(ConfigError::Validation(
                "daemon.rate_limit_window must be non-zero".to_string(),
            ));
        }
        if self.daemon.max_requests_per_window == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_requests_per_window must be non-zero".to_string(),
            ));
        }
        if self.station.sync_interval.is_zero() {
            return Err(ConfigError::Validation(
                "station.sync_interval must be non-zero".to_string(),
            ));
        }
        for credential in &self.daemon.operators {
            if credential.token.is_empty() || credential.operator_id.is_empty() {
                return Err(ConfigError::Validation(
                    "daemon.operators entries need both token and operator_id".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Reconciliation daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the HTTP surface binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Path to the guest registry database.
    #[serde(default = "default_guest_db")]
    pub guest_db: PathBuf,

    /// Path to the audit log database.
    #[serde(default = "default_audit_db")]
    pub audit_db: PathBuf,

    /// Requests allowed per caller within the window.
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u32,

    /// Sliding rate-limit window.
    #[serde(default = "default_rate_limit_window")]
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,

    /// Operator credentials accepted by the capability check.
    #[serde(default)]
    pub operators: Vec<OperatorCredential>,
}

/// A bearer credential mapped to an operator identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCredential {
    /// Bearer token the station presents.
    pub token: String,

    /// Caller identity recorded as the processing actor.
    pub operator_id: String,
}

const fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        8460,
    )
}

fn default_guest_db() -> PathBuf {
    PathBuf::from("usher-guests.db")
}

fn default_audit_db() -> PathBuf {
    PathBuf::from("usher-audit.db")
}

const fn default_max_requests() -> u32 {
    60
}

const fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            guest_db: default_guest_db(),
            audit_db: default_audit_db(),
            max_requests_per_window: default_max_requests(),
            rate_limit_window: default_rate_limit_window(),
            operators: Vec::new(),
        }
    }
}

/// Operator station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Base URL of the reconciliation daemon.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Bearer token presented on sync calls.
    #[serde(default)]
    pub token: String,

    /// Operator identity recorded on outbox entries.
    #[serde(default = "default_operator_id")]
    pub operator_id: String,

    /// Path to the local durable store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Periodic sync interval.
    #[serde(default = "default_sync_interval")]
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Timeout applied to direct submissions and sync requests.
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Backoff between failed sync cycles.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8460".to_string()
}

fn default_operator_id() -> String {
    "front-desk".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("usher-station.db")
}

const fn default_sync_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: String::new(),
            operator_id: default_operator_id(),
            store_path: default_store_path(),
            sync_interval: default_sync_interval(),
            request_timeout: default_request_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}
