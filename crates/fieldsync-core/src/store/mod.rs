//! Persistence seam
//!
//! The engine talks to databases only through [`StoreConnector`] and
//! [`StoreConnection`]. [`LibSqlConnector`] backs them with libSQL (local
//! files or remote servers); [`MemoryConnector`] is an in-process store with
//! fault injection and simulated replication lag for tests.

mod libsql_store;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::HostSpec;
use crate::error::Result;
use crate::models::{BatchId, RecordId, SyncRecord, SyncStatus};

pub use libsql_store::LibSqlConnector;
pub use memory::{Fault, MemoryConnector, MemoryHost};

/// Optimistic guard for [`StoreConnection::update_record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub version: i64,
    pub status: SyncStatus,
}

impl Expected {
    pub const fn of(record: &SyncRecord) -> Self {
        Self {
            version: record.version,
            status: record.status,
        }
    }
}

/// Opens connections to a host
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, host: &HostSpec) -> Result<Box<dyn StoreConnection>>;
}

/// One database connection
///
/// Statements outside `begin`/`commit` run in autocommit mode. Dropping a
/// connection inside a transaction discards its uncommitted changes.
#[async_trait]
pub trait StoreConnection: Send {
    async fn ping(&mut self) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn load_record(&mut self, id: &RecordId) -> Result<Option<SyncRecord>>;

    /// All records of a batch, oldest first
    async fn load_batch(&mut self, batch_id: &BatchId) -> Result<Vec<SyncRecord>>;

    /// Insert a new row; a duplicate id is reported as `Error::Contention`
    async fn insert_record(&mut self, record: &SyncRecord) -> Result<()>;

    /// Overwrite the mutable columns of `record` if the stored row still
    /// matches `expected`. Returns the number of rows changed (0 or 1).
    async fn update_record(&mut self, record: &SyncRecord, expected: Expected) -> Result<u64>;

    /// Age of the newest replicated heartbeat; `None` if none has arrived
    async fn replication_lag(&mut self) -> Result<Option<Duration>>;

    /// Stamp the heartbeat row; called on the primary
    async fn write_heartbeat(&mut self) -> Result<()>;
}
