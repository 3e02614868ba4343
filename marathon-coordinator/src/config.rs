//! Coordinator configuration, sourced from `MARATHON_*` environment
//! variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Runtime configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address the framed TCP endpoint binds to.
    pub listen_address: String,
    /// Port the framed TCP endpoint binds to.
    pub listen_port: u16,
    /// A node whose last heartbeat is older than this is stale.
    pub stale_timeout: Duration,
    /// Interval between scheduling passes.
    pub schedule_interval: Duration,
}

impl CoordinatorConfig {
    /// Reads configuration from the environment; unset values default,
    /// malformed values are rejected.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_address: env_or("MARATHON_LISTEN_ADDRESS", "0.0.0.0"),
            listen_port: env_parse("MARATHON_LISTEN_PORT", 7070)?,
            stale_timeout: Duration::from_secs(env_parse("MARATHON_STALE_TIMEOUT_SECS", 30)?),
            schedule_interval: Duration::from_secs(env_parse(
                "MARATHON_SCHEDULE_INTERVAL_SECS",
                1,
            )?),
        })
    }

    /// `host:port` to bind.
    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

/// Returns the variable's value, or `default` when unset.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parses the variable when set; unset falls back to `default`.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
