use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::model::Ms;

const PREFIX: &str = "BOXOFFICE_";

/// Server settings, read from `BOXOFFICE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Lifetime of a checkout hold inserted without `expires_at`.
    pub hold_ttl_ms: Ms,
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            port: try_load(&lookup, "PORT", 5433)?,
            bind: try_load(&lookup, "BIND", "0.0.0.0".to_string())?,
            data_dir: PathBuf::from(try_load(&lookup, "DATA_DIR", "./data".to_string())?),
            password: try_load(&lookup, "PASSWORD", "boxoffice".to_string())?,
            max_connections: try_load(&lookup, "MAX_CONNECTIONS", 256)?,
            compact_threshold: try_load(&lookup, "COMPACT_THRESHOLD", 1000)?,
            hold_ttl_ms: try_load(&lookup, "HOLD_TTL_MS", 15 * 60 * 1000)?,
            reaper_interval: Duration::from_millis(try_load(&lookup, "REAPER_INTERVAL_MS", 5_000)?),
            metrics_port: optional(&lookup, "METRICS_PORT")?,
            tls_cert: optional(&lookup, "TLS_CERT")?,
            tls_key: optional(&lookup, "TLS_KEY")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "BOXOFFICE_MAX_CONNECTIONS",
                reason: "must be at least 1".into(),
            });
        }
        if self.hold_ttl_ms <= 0 || self.hold_ttl_ms > crate::limits::MAX_HOLD_TTL_MS {
            return Err(ConfigError::Invalid {
                key: "BOXOFFICE_HOLD_TTL_MS",
                reason: format!("must be in 1..={}", crate::limits::MAX_HOLD_TTL_MS),
            });
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "BOXOFFICE_REAPER_INTERVAL_MS",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(lookup, key)? {
        Some(value) => Ok(value),
        None => {
            info!("{PREFIX}{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let full = format!("{PREFIX}{key}");
    let Some(raw) = lookup(&full).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Parse {
            key: full,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

#[derive(Debug)]
pub enum ConfigError {
    Parse {
        key: String,
        value: String,
        reason: String,
    },
    Invalid {
        key: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse { key, value, reason } => {
                write!(f, "invalid {key}={value:?}: {reason}")
            }
            ConfigError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
