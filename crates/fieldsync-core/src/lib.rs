//! fieldsync core library
//!
//! Server side of offline-first record sync: users are placed on shards,
//! writes go through a circuit breaker into an idempotent, versioned upsert on
//! the primary, and status reads prefer replicas that are caught up.

pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod reader;
pub mod shard;
pub mod store;
pub mod writer;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use config::{EngineConfig, HostSpec};
pub use engine::{EngineHealth, HealthStatus, SyncEngine};
pub use error::{Error, Result};
pub use metrics::MetricsReporter;
pub use models::*;
pub use store::{LibSqlConnector, MemoryConnector, MemoryHost, StoreConnector};
pub use writer::{WriteOutcome, WriteReceipt};
