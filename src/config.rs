//! Server configuration: defaults, TOML file and environment overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Environment variables**: values from `WSCHANNEL_*` env vars
//! 2. **Config file**: values loaded from a TOML file (requires `config-file` feature)
//! 3. **Defaults**: built-in defaults from [`ServerConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `WSCHANNEL_HOST` | `String` | `host` |
//! | `WSCHANNEL_PORT` | `u16` | `port` |
//! | `WSCHANNEL_MAX_CONNECTIONS` | `usize` | `max_connections` |
//! | `WSCHANNEL_MAX_CONNECTIONS_PER_IP` | `usize` | `max_connections_per_ip` |
//! | `WSCHANNEL_MAX_REQUESTS_PER_MINUTE` | `u32` | `max_requests_per_minute` |
//! | `WSCHANNEL_CHECK_ORIGIN` | `bool` | `check_origin` |
//! | `WSCHANNEL_ALLOWED_ORIGINS` | comma separated | `allowed_origins` |
//! | `WSCHANNEL_MAX_PAYLOAD_SIZE` | `usize` | `max_payload_size` |

use crate::channel::ChannelConfig;
use crate::repository::{AdmissionLimits, OriginValidator, DEFAULT_KIND};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Environment variable name for the bind host.
pub const ENV_HOST: &str = "WSCHANNEL_HOST";
/// Environment variable name for the bind port.
pub const ENV_PORT: &str = "WSCHANNEL_PORT";
/// Environment variable name for the global connection cap.
pub const ENV_MAX_CONNECTIONS: &str = "WSCHANNEL_MAX_CONNECTIONS";
/// Environment variable name for the per-IP connection cap.
pub const ENV_MAX_CONNECTIONS_PER_IP: &str = "WSCHANNEL_MAX_CONNECTIONS_PER_IP";
/// Environment variable name for the per-connection request rate.
pub const ENV_MAX_REQUESTS_PER_MINUTE: &str = "WSCHANNEL_MAX_REQUESTS_PER_MINUTE";
/// Environment variable name for the origin check toggle.
pub const ENV_CHECK_ORIGIN: &str = "WSCHANNEL_CHECK_ORIGIN";
/// Environment variable name for the origin allow-list.
pub const ENV_ALLOWED_ORIGINS: &str = "WSCHANNEL_ALLOWED_ORIGINS";
/// Environment variable name for the frame payload cap.
pub const ENV_MAX_PAYLOAD_SIZE: &str = "WSCHANNEL_MAX_PAYLOAD_SIZE";

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable is set to something unparseable.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid TOML for [`ServerConfig`].
    #[cfg(feature = "config-file")]
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Everything needed to build a [`Server`](crate::server::Server).
///
/// ```toml
/// host = "0.0.0.0"
/// port = 9000
/// check_origin = true
/// allowed_origins = ["example.com"]
///
/// [[channels]]
/// name = "lobby"
/// reconnection_period_secs = 30
/// password = "hunter2"
///
/// [channels.parameters]
/// maxPlayers = 4
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Total connections.
    pub max_connections: usize,
    /// Connections from one IP.
    pub max_connections_per_ip: usize,
    /// Read events per connection per minute.
    pub max_requests_per_minute: u32,
    /// Whether the `Origin` header is checked.
    pub check_origin: bool,
    /// Accepted origins.
    pub allowed_origins: Vec<String>,
    /// Largest accepted frame payload in bytes.
    pub max_payload_size: usize,
    /// Loop tick for the CLI host, in milliseconds.
    pub tick_interval_ms: u64,
    /// Channels created at startup.
    pub channels: Vec<ChannelSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = AdmissionLimits::default();
        Self {
            host: "localhost".to_string(),
            port: 8000,
            max_connections: limits.max_connections,
            max_connections_per_ip: limits.max_connections_per_ip,
            max_requests_per_minute: limits.max_requests_per_minute,
            check_origin: true,
            allowed_origins: Vec::new(),
            max_payload_size: limits.max_payload_size,
            tick_interval_ms: 10,
            channels: Vec::new(),
        }
    }
}

/// A channel declared in configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelSpec {
    /// Channel name; clients reach it at `/<name>`.
    pub name: String,
    /// Registered channel kind.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Reconnect window in seconds; zero disables reconnects.
    #[serde(default)]
    pub reconnection_period_secs: u64,
    /// Password required on connect.
    #[serde(default)]
    pub password: Option<String>,
    /// Application parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

impl ChannelSpec {
    /// Default-kind channel with no options.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_kind(),
            reconnection_period_secs: 0,
            password: None,
            parameters: Map::new(),
        }
    }

    /// The [`ChannelConfig`] this spec describes.
    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            reconnection_period: Duration::from_secs(self.reconnection_period_secs),
            password: self.password.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl ServerConfig {
    /// Admission thresholds.
    #[must_use]
    pub fn limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_connections: self.max_connections,
            max_connections_per_ip: self.max_connections_per_ip,
            max_requests_per_minute: self.max_requests_per_minute,
            max_payload_size: self.max_payload_size,
        }
    }

    /// Origin gate.
    #[must_use]
    pub fn origin_validator(&self) -> OriginValidator {
        OriginValidator::new(self.check_origin, &self.allowed_origins)
    }

    /// CLI loop tick.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Parse a TOML document; missing keys keep their defaults.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Read and parse a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `WSCHANNEL_*` overrides. Only variables that are set are
    /// applied; a set but unparseable value is an error.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_HOST) {
            self.host = val.trim().to_string();
        }
        if let Some(val) = read_env(ENV_PORT) {
            self.port = parse(ENV_PORT, &val)?;
        }
        if let Some(val) = read_env(ENV_MAX_CONNECTIONS) {
            self.max_connections = parse(ENV_MAX_CONNECTIONS, &val)?;
        }
        if let Some(val) = read_env(ENV_MAX_CONNECTIONS_PER_IP) {
            self.max_connections_per_ip = parse(ENV_MAX_CONNECTIONS_PER_IP, &val)?;
        }
        if let Some(val) = read_env(ENV_MAX_REQUESTS_PER_MINUTE) {
            self.max_requests_per_minute = parse(ENV_MAX_REQUESTS_PER_MINUTE, &val)?;
        }
        if let Some(val) = read_env(ENV_CHECK_ORIGIN) {
            self.check_origin = parse_bool(ENV_CHECK_ORIGIN, &val)?;
        }
        if let Some(val) = read_env(ENV_ALLOWED_ORIGINS) {
            self.allowed_origins = val
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(val) = read_env(ENV_MAX_PAYLOAD_SIZE) {
            self.max_payload_size = parse(ENV_MAX_PAYLOAD_SIZE, &val)?;
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse<T: std::str::FromStr>(var: &'static str, val: &str) -> Result<T, ConfigError> {
    val.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: val.to_string(),
    })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: val.to_string(),
        }),
    }
}
