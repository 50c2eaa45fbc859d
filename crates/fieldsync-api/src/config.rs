use std::collections::HashMap;
use std::env;
use std::time::Duration;

use fieldsync_core::EngineConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Service settings; database credentials are redacted by the engine
/// config's `Debug`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Deadline applied to each submitted write
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "FIELDSYNC_BIND_ADDR", "127.0.0.1:8080");
        let request_timeout = parse_secs(&lookup, "FIELDSYNC_REQUEST_TIMEOUT_SECS", 60)?;
        let shutdown_grace = parse_secs(&lookup, "FIELDSYNC_SHUTDOWN_GRACE_SECS", 30)?;

        if optional_trimmed(&lookup, "DB_PRIMARY_URL").is_none() {
            return Err(ConfigError::MissingVar("DB_PRIMARY_URL"));
        }
        let engine = EngineConfig::from_lookup(&lookup)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        Ok(Self {
            bind_addr,
            request_timeout,
            shutdown_grace,
            engine,
        })
    }
}

fn parse_secs(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds"
        ))),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
