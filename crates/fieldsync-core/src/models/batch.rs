//! Batch intake and outcome models

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{BatchId, RecordId, SyncRequest, SyncStatus};
use crate::error::{Error, Result};

/// Records submitted together by one client upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    #[serde(default)]
    pub batch_id: BatchId,
    pub records: Vec<SyncRequest>,
}

impl SyncBatch {
    pub fn new(records: Vec<SyncRequest>) -> Self {
        Self {
            batch_id: BatchId::new(),
            records,
        }
    }

    /// Check batch shape: non-empty, bounded, no repeated record ids.
    pub fn validate(&self, max_batch_size: usize) -> Result<()> {
        if self.batch_id.is_nil() {
            return Err(Error::InvalidRecord("batch id must not be nil".into()));
        }
        if self.records.is_empty() {
            return Err(Error::InvalidRecord("batch contains no records".into()));
        }
        if self.records.len() > max_batch_size {
            return Err(Error::InvalidRecord(format!(
                "batch holds {} records; the limit is {max_batch_size}",
                self.records.len()
            )));
        }
        let mut seen = HashSet::with_capacity(self.records.len());
        for record in &self.records {
            if !seen.insert(record.id) {
                return Err(Error::InvalidRecord(format!(
                    "record {} appears more than once in batch {}",
                    record.id, self.batch_id
                )));
            }
        }
        Ok(())
    }
}

/// Result of one record within a submitted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: RecordId,
    pub status: SyncStatus,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Per-record outcomes of a submitted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub total: usize,
    pub committed: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Cut off by a deadline; still pending and safe to resubmit
    pub pending: usize,
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn from_outcomes(batch_id: BatchId, outcomes: Vec<RecordOutcome>) -> Self {
        let count = |status: SyncStatus| outcomes.iter().filter(|o| o.status == status).count();
        Self {
            batch_id,
            total: outcomes.len(),
            committed: count(SyncStatus::Committed),
            conflicts: count(SyncStatus::Conflict),
            failed: count(SyncStatus::Failed),
            pending: count(SyncStatus::Pending) + count(SyncStatus::Processing),
            outcomes,
        }
    }

    /// Completed plus failed accounts for every record
    pub fn is_complete(&self) -> bool {
        self.committed + self.conflicts + self.failed == self.total
    }
}
