//! Configuration management for the server.

use arbor_engine::{CommandDispatch, ReplicationConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Time between replication ticks
    pub tick_interval: Duration,
    /// Replication tuning handed to the engine
    pub replication: ReplicationConfig,
    /// Optional JSON component manifest; the embedded one is used otherwise
    pub manifest_path: Option<PathBuf>,
    /// Id of the hosted store
    pub store_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let tick_interval_ms: u64 = parse_var(&lookup, "TICK_INTERVAL_MS", 50)?;
        if tick_interval_ms == 0 {
            return Err(ConfigError::invalid("TICK_INTERVAL_MS", "0"));
        }

        let defaults = ReplicationConfig::default();
        let replication = ReplicationConfig {
            history_capacity: parse_var(&lookup, "HISTORY_CAPACITY", defaults.history_capacity)?,
            resync_timeout_ticks: parse_var(
                &lookup,
                "RESYNC_TIMEOUT_TICKS",
                defaults.resync_timeout_ticks,
            )?,
            command_dispatch: parse_var(
                &lookup,
                "COMMAND_DISPATCH",
                CommandDispatch::default(),
            )?,
            max_apply_passes: defaults.max_apply_passes,
            debug_hash_checks: parse_var(&lookup, "DEBUG_HASH_CHECKS", false)?,
        };

        let manifest_path = lookup("MANIFEST_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let store_id = lookup("STORE_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "world".to_string());

        Ok(Self {
            host,
            port,
            tick_interval: Duration::from_millis(tick_interval_ms),
            replication,
            manifest_path,
            store_id,
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(name, &value)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {name} value: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str) -> Self {
        Self::InvalidValue {
            name,
            value: value.to_string(),
        }
    }
}
