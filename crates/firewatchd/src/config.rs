//! Daemon configuration.
//!
//! Loaded in three layers: built-in defaults, an optional TOML file, then
//! `FIREWATCH_*` environment variables. The shared secrets come only from
//! the environment and are hashed on the spot.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use firewatch_core::SecretHash;

pub const ENV_SENSOR_ADDR: &str = "FIREWATCH_SENSOR_ADDR";
pub const ENV_MONITOR_ADDR: &str = "FIREWATCH_MONITOR_ADDR";
pub const ENV_HANDOFF_DIR: &str = "FIREWATCH_HANDOFF_DIR";
pub const ENV_SILENCE_TIMEOUT: &str = "FIREWATCH_SILENCE_TIMEOUT_SECS";
pub const ENV_SENSOR_SECRET: &str = "FIREWATCH_SENSOR_SECRET";
pub const ENV_MONITOR_SECRET: &str = "FIREWATCH_MONITOR_SECRET";

/// Upper bound for every timeout and interval setting (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("missing required secret: set {0}")]
    MissingSecret(&'static str),
}

/// Tunable daemon settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen address for sensor connections
    pub sensor_addr: SocketAddr,
    /// Listen address for monitor connections
    pub monitor_addr: SocketAddr,
    /// Directory shared by the `ingest` and `relay` processes
    pub handoff_dir: PathBuf,
    /// How often the relay process polls the handoff directory
    pub handoff_poll_ms: u64,
    /// Time a sensor has to send its first frame
    pub auth_timeout_secs: u64,
    /// Quiet period after which a sensor is reported as silent
    pub silence_timeout_secs: u64,
    /// Connections allowed to be mid-authentication at once
    pub max_pending_auth: usize,
    pub max_sensors: usize,
    pub max_monitors: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sensor_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            monitor_addr: SocketAddr::from(([127, 0, 0, 1], 9002)),
            handoff_dir: std::env::temp_dir().join("firewatch").join("handoff"),
            handoff_poll_ms: 500,
            auth_timeout_secs: 10,
            silence_timeout_secs: 3600,
            max_pending_auth: 64,
            max_sensors: crate::registry::MAX_SENSORS,
            max_monitors: crate::monitors::DEFAULT_MAX_MONITORS,
        }
    }
}

impl DaemonConfig {
    /// Loads defaults, then the file (if any), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Applies `FIREWATCH_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_SENSOR_ADDR) {
            self.sensor_addr = parse_value(ENV_SENSOR_ADDR, &value)?;
        }
        if let Some(value) = lookup(ENV_MONITOR_ADDR) {
            self.monitor_addr = parse_value(ENV_MONITOR_ADDR, &value)?;
        }
        if let Some(value) = lookup(ENV_HANDOFF_DIR) {
            self.handoff_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_SILENCE_TIMEOUT) {
            self.silence_timeout_secs = parse_value(ENV_SILENCE_TIMEOUT, &value)?;
        }
        debug!(config = ?self, "Applied environment overrides");
        Ok(())
    }

    /// Rejects settings that would make the daemon unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("handoff_poll_ms", self.handoff_poll_ms),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("silence_timeout_secs", self.silence_timeout_secs),
            ("max_pending_auth", self.max_pending_auth as u64),
            ("max_sensors", self.max_sensors as u64),
            ("max_monitors", self.max_monitors as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let bounded = [
            ("handoff_poll_ms", self.handoff_poll_ms, MAX_TIMEOUT_SECS * 1000),
            ("auth_timeout_secs", self.auth_timeout_secs, MAX_TIMEOUT_SECS),
            ("silence_timeout_secs", self.silence_timeout_secs, MAX_TIMEOUT_SECS),
        ];
        for (key, value, max) in bounded {
            if value > max {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: format!("must be at most {max}"),
                });
            }
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_secs)
    }

    pub fn handoff_poll(&self) -> Duration {
        Duration::from_millis(self.handoff_poll_ms)
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Hashed shared secrets.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub sensor: SecretHash,
    pub monitor: SecretHash,
}

impl Secrets {
    /// Reads and hashes both secrets from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            sensor: hash_secret(&lookup, ENV_SENSOR_SECRET)?,
            monitor: hash_secret(&lookup, ENV_MONITOR_SECRET)?,
        })
    }
}

/// Reads and hashes a single secret from the process environment.
///
/// Split-process modes need only one of the two secrets.
pub fn secret_from_env(key: &'static str) -> Result<SecretHash, ConfigError> {
    hash_secret(&|key: &str| std::env::var(key).ok(), key)
}

fn hash_secret<F>(lookup: &F, key: &'static str) -> Result<SecretHash, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.is_empty())
        .map(|value| SecretHash::of(&value))
        .ok_or(ConfigError::MissingSecret(key))
}
