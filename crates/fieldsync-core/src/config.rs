//! Engine configuration
//!
//! Values come from environment variables through [`EngineConfig::from_env`];
//! [`EngineConfig::from_lookup`] takes any lookup function so configuration
//! can be built from maps in tests.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::EntityType;

/// Default per-attempt query timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default upper bound on records per batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
/// Default retry bound; a write gets this many re-attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default backoff base; re-attempts wait 2s, 4s, 8s
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);
/// Default breaker open duration
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

/// A database host: primary or replica
#[derive(Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Short label used as pool key and in logs
    pub name: String,
    /// `file:` / path, `libsql://`, `http(s)://`, or `memory:` for in-process stores
    pub url: String,
    pub auth_token: Option<String>,
}

impl HostSpec {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: host_label(&url),
            url,
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        ["libsql://", "http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
    }
}

impl fmt::Debug for HostSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HostSpec")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

fn host_label(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => rest
            .split(['/', '?'])
            .next()
            .filter(|host| !host.is_empty())
            .unwrap_or(rest)
            .to_string(),
        None => url.trim_start_matches("file:").to_string(),
    }
}

/// Connection pool limits, applied per host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry and validation policy for the transactional writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    pub query_timeout: Duration,
    pub max_retries: u32,
    /// Backoff before the `n`th re-attempt (0-based) is `retry_base * 2^n`
    pub retry_base: Duration,
    /// Empty means any well-formed entity type is accepted
    pub allowed_entity_types: Vec<EntityType>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
            allowed_entity_types: Vec::new(),
        }
    }
}

/// Trip and recovery thresholds for the write circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Requests needed in a window before the ratio is considered
    pub min_requests: u32,
    pub failure_ratio: f64,
    /// Closed-state counts reset at every window boundary
    pub window: Duration,
    pub cooldown: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: 3,
            failure_ratio: 0.6,
            window: Duration::from_secs(60),
            cooldown: DEFAULT_BREAKER_COOLDOWN,
            half_open_max_calls: 1,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub primary: HostSpec,
    pub replicas: Vec<HostSpec>,
    pub shard_count: u32,
    pub pool: PoolConfig,
    pub writer: WriterConfig,
    pub breaker: BreakerConfig,
    /// Replicas lagging more than this are bypassed for reads
    pub max_replica_lag: Duration,
    pub max_batch_size: usize,
    pub max_concurrent_writes: usize,
    pub heartbeat_interval: Duration,
    /// How long deadline-cut submissions and replay membership stay visible
    /// to status queries
    pub status_retention: Duration,
}

impl EngineConfig {
    /// Defaults for everything but the primary host.
    pub fn new(primary: HostSpec) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
            shard_count: 3,
            pool: PoolConfig::default(),
            writer: WriterConfig::default(),
            breaker: BreakerConfig::default(),
            max_replica_lag: Duration::from_secs(5),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_concurrent_writes: 50,
            heartbeat_interval: Duration::from_secs(5),
            status_retention: Duration::from_secs(600),
        }
    }

    #[must_use]
    pub fn with_replicas(mut self, replicas: Vec<HostSpec>) -> Self {
        self.replicas = replicas;
        self
    }

    /// Pool keys must be unique: no replica may share a name with the
    /// primary or with another replica.
    pub fn check_hosts(&self) -> Result<()> {
        let mut names = HashSet::from([self.primary.name.as_str()]);
        for replica in &self.replicas {
            if !names.insert(replica.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "DB_REPLICA_URLS repeats host '{}'",
                    replica.name
                )));
            }
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let auth_token = optional_trimmed(&lookup, "DB_AUTH_TOKEN");
        let with_token = |spec: HostSpec| match &auth_token {
            Some(token) if spec.is_remote() => spec.with_auth_token(token.clone()),
            _ => spec,
        };

        let primary_url = required_trimmed(&lookup, "DB_PRIMARY_URL")?;
        let primary = with_token(HostSpec::new(primary_url));

        let replicas: Vec<HostSpec> = optional_trimmed(&lookup, "DB_REPLICA_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(|url| with_token(HostSpec::new(url)))
                    .collect()
            })
            .unwrap_or_default();

        let shard_count = parse_in_range(&lookup, "DB_SHARD_COUNT", 3_u32, 1..=4_096)?;
        let max_connections = parse_in_range(&lookup, "DB_MAX_CONNECTIONS", 100_usize, 1..=10_000)?;
        let acquire_timeout_secs =
            parse_in_range(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", 30_u64, 1..=600)?;
        let query_timeout_secs = parse_in_range(&lookup, "DB_QUERY_TIMEOUT_SECS", 30_u64, 1..=600)?;
        let max_replica_lag_ms =
            parse_in_range(&lookup, "DB_MAX_REPLICA_LAG_MS", 5_000_u64, 0..=3_600_000)?;

        let max_retries = parse_in_range(&lookup, "SYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES, 0..=10)?;
        let retry_base_ms = parse_in_range(&lookup, "SYNC_RETRY_BASE_MS", 2_000_u64, 0..=60_000)?;
        let max_batch_size = parse_in_range(
            &lookup,
            "SYNC_MAX_BATCH_SIZE",
            DEFAULT_MAX_BATCH_SIZE,
            1..=100_000,
        )?;
        let max_concurrent_writes =
            parse_in_range(&lookup, "SYNC_MAX_CONCURRENT_WRITES", 50_usize, 1..=10_000)?;
        let allowed_entity_types = optional_trimmed(&lookup, "SYNC_ALLOWED_ENTITY_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| {
                        EntityType::parse(value).map_err(|_| {
                            Error::Configuration(format!(
                                "SYNC_ALLOWED_ENTITY_TYPES contains invalid type '{value}'"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let min_requests = parse_in_range(&lookup, "BREAKER_MIN_REQUESTS", 3_u32, 1..=10_000)?;
        let failure_ratio = value_or_default(&lookup, "BREAKER_FAILURE_RATIO", "0.6")
            .parse::<f64>()
            .map_err(|_| {
                Error::Configuration("BREAKER_FAILURE_RATIO must be a number in (0, 1]".to_string())
            })?;
        if !(failure_ratio > 0.0 && failure_ratio <= 1.0) {
            return Err(Error::Configuration(
                "BREAKER_FAILURE_RATIO must be in (0, 1]".to_string(),
            ));
        }
        let window_secs = parse_in_range(&lookup, "BREAKER_WINDOW_SECS", 60_u64, 1..=86_400)?;
        let cooldown_secs = parse_in_range(&lookup, "BREAKER_COOLDOWN_SECS", 60_u64, 1..=86_400)?;
        let half_open_max_calls =
            parse_in_range(&lookup, "BREAKER_HALF_OPEN_CALLS", 1_u32, 1..=1_000)?;

        let heartbeat_secs = parse_in_range(&lookup, "FIELDSYNC_HEARTBEAT_SECS", 5_u64, 1..=3_600)?;
        let retention_secs =
            parse_in_range(&lookup, "FIELDSYNC_STATUS_RETENTION_SECS", 600_u64, 1..=86_400)?;

        let config = Self {
            primary,
            replicas,
            shard_count,
            pool: PoolConfig {
                max_connections,
                acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            },
            writer: WriterConfig {
                query_timeout: Duration::from_secs(query_timeout_secs),
                max_retries,
                retry_base: Duration::from_millis(retry_base_ms),
                allowed_entity_types,
            },
            breaker: BreakerConfig {
                min_requests,
                failure_ratio,
                window: Duration::from_secs(window_secs),
                cooldown: Duration::from_secs(cooldown_secs),
                half_open_max_calls,
            },
            max_replica_lag: Duration::from_millis(max_replica_lag_ms),
            max_batch_size,
            max_concurrent_writes,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            status_retention: Duration::from_secs(retention_secs),
        };
        config.check_hosts()?;
        Ok(config)
    }
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T>
where
    T: FromStr + PartialOrd + fmt::Display,
{
    let invalid = || {
        Error::Configuration(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(invalid());
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String> {
    optional_trimmed(lookup, name).ok_or_else(|| {
        Error::Configuration(format!("Missing required environment variable: {name}"))
    })
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn from_map(map: &HashMap<&str, &str>) -> Result<EngineConfig> {
        EngineConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_primary() {
        let map = HashMap::new();
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("DB_PRIMARY_URL"));
    }

    #[test]
    fn defaults_follow_documented_values() {
        let map = HashMap::from([("DB_PRIMARY_URL", "file:/var/lib/fieldsync/primary.db")]);
        let config = from_map(&map).unwrap();
        assert_eq!(config.primary.name, "/var/lib/fieldsync/primary.db");
        assert_eq!(config.shard_count, 3);
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.writer.query_timeout, Duration::from_secs(30));
        assert_eq!(config.writer.max_retries, 3);
        assert_eq!(config.writer.retry_base, Duration::from_secs(2));
        assert_eq!(config.status_retention, Duration::from_secs(600));
        assert_eq!(config.breaker.min_requests, 3);
        assert!((config.breaker.failure_ratio - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.max_concurrent_writes, 50);
        assert!(config.replicas.is_empty());
    }

    #[test]
    fn parses_replicas_and_attaches_token_to_remote_hosts() {
        let map = HashMap::from([
            ("DB_PRIMARY_URL", "libsql://primary.example.io"),
            (
                "DB_REPLICA_URLS",
                "libsql://replica-a.example.io, ,https://replica-b.example.io/db",
            ),
            ("DB_AUTH_TOKEN", "secret-token"),
        ]);
        let config = from_map(&map).unwrap();
        let names: Vec<_> = config.replicas.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["replica-a.example.io", "replica-b.example.io"]);
        assert_eq!(config.primary.auth_token.as_deref(), Some("secret-token"));

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("secret-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn rejects_zero_shards_and_bad_ratio() {
        let map = HashMap::from([("DB_PRIMARY_URL", "primary.db"), ("DB_SHARD_COUNT", "0")]);
        assert!(from_map(&map).unwrap_err().to_string().contains("DB_SHARD_COUNT"));

        let map = HashMap::from([
            ("DB_PRIMARY_URL", "primary.db"),
            ("BREAKER_FAILURE_RATIO", "1.5"),
        ]);
        assert!(from_map(&map).is_err());
    }

    #[test]
    fn rejects_replicas_sharing_a_host_name() {
        let map = HashMap::from([
            ("DB_PRIMARY_URL", "libsql://primary.example.io"),
            (
                "DB_REPLICA_URLS",
                "libsql://replica.example.io/site-a,libsql://replica.example.io/site-b",
            ),
        ]);
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("replica.example.io"));
    }

    #[test]
    fn rejects_replica_equal_to_primary() {
        let map = HashMap::from([
            ("DB_PRIMARY_URL", "libsql://db.example.io"),
            ("DB_REPLICA_URLS", "libsql://db.example.io"),
        ]);
        assert!(from_map(&map).is_err());
    }

    #[test]
    fn parses_entity_allowlist() {
        let map = HashMap::from([
            ("DB_PRIMARY_URL", "primary.db"),
            ("SYNC_ALLOWED_ENTITY_TYPES", "species, Fossil,collection"),
        ]);
        let config = from_map(&map).unwrap();
        let allowed: Vec<_> = config
            .writer
            .allowed_entity_types
            .iter()
            .map(EntityType::as_str)
            .collect();
        assert_eq!(allowed, vec!["species", "fossil", "collection"]);

        let map = HashMap::from([
            ("DB_PRIMARY_URL", "primary.db"),
            ("SYNC_ALLOWED_ENTITY_TYPES", "species,not valid"),
        ]);
        assert!(from_map(&map).is_err());
    }
}
