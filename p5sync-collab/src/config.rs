//! Server configuration.
//!
//! | Variable                    | Default          |
//! |-----------------------------|------------------|
//! | `P5SYNC_BIND`               | `127.0.0.1:8000` |
//! | `P5SYNC_DATA_DIR`           | unset (memory)   |
//! | `P5SYNC_CANVAS_WIDTH`       | `1280`           |
//! | `P5SYNC_CANVAS_HEIGHT`      | `720`            |
//! | `P5SYNC_BROADCAST_CAPACITY` | `256`            |
//!
//! Setting `P5SYNC_DATA_DIR` switches room logs to RocksDB under that
//! directory.

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::operation::CanvasBounds;
use crate::storage::StorageConfig;

pub const ENV_BIND: &str = "P5SYNC_BIND";
pub const ENV_DATA_DIR: &str = "P5SYNC_DATA_DIR";
pub const ENV_CANVAS_WIDTH: &str = "P5SYNC_CANVAS_WIDTH";
pub const ENV_CANVAS_HEIGHT: &str = "P5SYNC_CANVAS_HEIGHT";
pub const ENV_BROADCAST_CAPACITY: &str = "P5SYNC_BROADCAST_CAPACITY";

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Accepted coordinate range for drawing operations
    pub canvas: CanvasBounds,
    /// Backing store for room logs
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            broadcast_capacity: 256,
            canvas: CanvasBounds::default(),
            storage: StorageConfig::Memory,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `P5SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bind) = lookup(ENV_BIND) {
            if bind.trim().is_empty() {
                return Err(ConfigError::invalid(ENV_BIND, &bind, "empty address"));
            }
            config.bind_addr = bind;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.is_empty()) {
            config.storage = StorageConfig::Rocks(PathBuf::from(dir));
        }
        if let Some(width) = parse::<f64>(&lookup, ENV_CANVAS_WIDTH)? {
            config.canvas.width = positive(ENV_CANVAS_WIDTH, width)?;
        }
        if let Some(height) = parse::<f64>(&lookup, ENV_CANVAS_HEIGHT)? {
            config.canvas.height = positive(ENV_CANVAS_HEIGHT, height)?;
        }
        if let Some(capacity) = parse::<usize>(&lookup, ENV_BROADCAST_CAPACITY)? {
            if capacity == 0 {
                return Err(ConfigError::invalid(ENV_BROADCAST_CAPACITY, "0", "must be at least 1"));
            }
            config.broadcast_capacity = capacity;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e)),
    }
}

fn positive(key: &str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::invalid(key, &value.to_string(), "must be a positive number"))
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
