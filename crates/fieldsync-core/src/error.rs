//! Error types for fieldsync-core

use std::time::Duration;

use thiserror::Error;

use crate::models::RecordId;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid startup configuration; fatal
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A host could not be reached or a pool is closed
    #[error("Connection error ({host}): {message}")]
    Connection { host: String, message: String },

    /// The write circuit breaker is open
    #[error("Circuit breaker open; retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Same version with a different payload
    #[error(
        "Version conflict on record {id}: stored version {stored_version}, incoming version {incoming_version}"
    )]
    Conflict {
        id: RecordId,
        stored_version: i64,
        incoming_version: i64,
    },

    /// Transient database failure, safe to retry
    #[error("Transient database error: {0}")]
    Transient(String),

    /// Lost an optimistic race against a concurrent writer
    #[error("Write contention: {0}")]
    Contention(String),

    /// A single statement or pool acquisition exceeded its budget
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's overall deadline expired
    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Malformed record or batch
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Write would break a stored-row invariant
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Record or batch not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write failed for good; carries where and how often it was tried
    #[error("Write of record {id} on shard {shard_id} failed after {attempts} attempt(s): {source}")]
    WriteFailed {
        id: RecordId,
        shard_id: u32,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Stored data could not be decoded
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn connection(host: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.to_string(),
        }
    }

    /// Whether the writer may try the same write again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Contention(_) | Self::Timeout(_) | Self::Connection { .. } => {
                true
            }
            Self::LibSql(err) => is_retryable_message(&err.to_string()),
            _ => false,
        }
    }

    /// Whether the outcome is an infrastructure failure for breaker accounting.
    ///
    /// Business outcomes such as conflicts and rejected records are successes
    /// from the breaker's point of view: the database answered.
    pub fn is_infrastructure_failure(&self) -> bool {
        match self {
            Self::Conflict { .. }
            | Self::InvalidRecord(_)
            | Self::Constraint(_)
            | Self::NotFound(_)
            | Self::Serialization(_)
            | Self::CircuitOpen { .. }
            | Self::Configuration(_) => false,
            Self::WriteFailed { source, .. } => source.is_infrastructure_failure(),
            _ => true,
        }
    }

    /// The innermost error, skipping `WriteFailed` context.
    pub fn root(&self) -> &Self {
        match self {
            Self::WriteFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Classify a driver message as transient.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "busy",
        "locked",
        "timeout",
        "timed out",
        "connection reset",
        "broken pipe",
        "serialization",
        "deadlock",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Whether a driver message reports a primary key or unique index collision.
pub(crate) fn is_unique_violation(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unique constraint") || lower.contains("primary key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::Transient("reset".into()).is_retryable());
        assert!(Error::Contention("cas miss".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::connection("primary", "refused").is_retryable());
    }

    #[test]
    fn business_errors_are_not_retryable() {
        let conflict = Error::Conflict {
            id: RecordId::new(),
            stored_version: 5,
            incoming_version: 5,
        };
        assert!(!conflict.is_retryable());
        assert!(!conflict.is_infrastructure_failure());
        assert!(!Error::InvalidRecord("nil id".into()).is_retryable());
        assert!(!Error::Constraint("user mismatch".into()).is_infrastructure_failure());
    }

    #[test]
    fn write_failed_reports_root_cause() {
        let err = Error::WriteFailed {
            id: RecordId::new(),
            shard_id: 2,
            attempts: 4,
            source: Box::new(Error::Transient("database is locked".into())),
        };
        assert!(!err.is_retryable());
        assert!(err.is_infrastructure_failure());
        assert!(matches!(err.root(), Error::Transient(_)));
        assert!(err.to_string().contains("after 4 attempt(s)"));
    }

    #[test]
    fn classifies_driver_messages() {
        assert!(is_retryable_message("SQLITE_BUSY: database is locked"));
        assert!(is_retryable_message("Connection reset by peer"));
        assert!(!is_retryable_message("no such table: sync_records"));
        assert!(is_unique_violation(
            "UNIQUE constraint failed: sync_records.id"
        ));
    }
}
