//! Configuration loading and representation.
//!
//! Values come from the process environment, after a `.env` file (if any) has
//! been loaded into it. Everything except the database URL has a default.

use std::env;
use std::time::Duration;

use thiserror::Error;

use payalloc_allocation::AllocationStrategy;

pub const DATABASE_URL: &str = "PAYALLOC_DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "PAYALLOC_DB_MAX_CONNECTIONS";
pub const DB_ACQUIRE_TIMEOUT_SECS: &str = "PAYALLOC_DB_ACQUIRE_TIMEOUT_SECS";
pub const DEFAULT_STRATEGY: &str = "PAYALLOC_DEFAULT_STRATEGY";

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the allocation store and service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub default_strategy: AllocationStrategy,
}

impl AllocationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(DATABASE_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        let max_connections = match lookup(DB_MAX_CONNECTIONS) {
            Some(raw) => parse_positive(DB_MAX_CONNECTIONS, &raw)?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let acquire_timeout_secs = match lookup(DB_ACQUIRE_TIMEOUT_SECS) {
            Some(raw) => parse_positive(DB_ACQUIRE_TIMEOUT_SECS, &raw)?,
            None => DEFAULT_ACQUIRE_TIMEOUT_SECS,
        };

        let default_strategy = match lookup(DEFAULT_STRATEGY) {
            Some(raw) => raw
                .trim()
                .parse::<AllocationStrategy>()
                .map_err(|e| ConfigError::Invalid {
                    key: DEFAULT_STRATEGY,
                    value: raw.clone(),
                    reason: e.to_string(),
                })?,
            None => AllocationStrategy::Fifo,
        };

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            default_strategy,
        })
    }
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr + PartialOrd + Default,
    T::Err: core::fmt::Display,
{
    let value: T = raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })?;

    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
