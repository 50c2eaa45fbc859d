//! Record lifecycle and status views

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{BatchId, RecordId, SyncRecord};
use crate::error::Error;

/// Lifecycle of a sync record: `pending -> processing -> committed | conflict | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Processing,
    Committed,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Committed => "committed",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// No further work happens without a new submission.
    ///
    /// `conflict` counts as settled; a resubmission with a higher version
    /// reopens it.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Conflict | Self::Failed)
    }

    /// Whether the stored row ever carried a committed payload.
    pub const fn has_committed_data(self) -> bool {
        matches!(self, Self::Committed | Self::Conflict)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "committed" => Ok(Self::Committed),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidRecord(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Where a read was served from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "host", rename_all = "lowercase")]
pub enum ReadSource {
    Primary,
    Replica(String),
    /// Known only to this process; not yet persisted
    InFlight,
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Replica(host) => write!(f, "replica:{host}"),
            Self::InFlight => f.write_str("in_flight"),
        }
    }
}

/// Status boundary view of a single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordStatusView {
    pub id: RecordId,
    pub batch_id: BatchId,
    pub status: SyncStatus,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
    pub source: ReadSource,
}

impl RecordStatusView {
    pub fn from_record(record: &SyncRecord, source: ReadSource) -> Self {
        Self {
            id: record.id,
            batch_id: record.batch_id,
            status: record.status,
            version: record.version,
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
            updated_at: record.updated_at,
            source,
        }
    }
}

/// Aggregated status of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusView {
    pub batch_id: BatchId,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub committed: usize,
    pub conflict: usize,
    pub failed: usize,
    /// Every record has reached a terminal status
    pub complete: bool,
    pub records: Vec<RecordStatusView>,
}

impl BatchStatusView {
    pub fn from_records(batch_id: BatchId, records: Vec<RecordStatusView>) -> Self {
        let mut view = Self {
            batch_id,
            total: records.len(),
            pending: 0,
            processing: 0,
            committed: 0,
            conflict: 0,
            failed: 0,
            complete: false,
            records: Vec::new(),
        };
        for record in &records {
            match record.status {
                SyncStatus::Pending => view.pending += 1,
                SyncStatus::Processing => view.processing += 1,
                SyncStatus::Committed => view.committed += 1,
                SyncStatus::Conflict => view.conflict += 1,
                SyncStatus::Failed => view.failed += 1,
            }
        }
        view.complete = view.total > 0 && view.committed + view.conflict + view.failed == view.total;
        view.records = records;
        view
    }
}
