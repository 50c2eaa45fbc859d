//! Data models for fieldsync

mod batch;
mod ids;
mod record;
mod status;

pub use batch::{BatchReport, RecordOutcome, SyncBatch};
pub use ids::{BatchId, RecordId, UserId};
pub use record::{payload_hash, EntityType, SyncRecord, SyncRequest};
pub use status::{BatchStatusView, ReadSource, RecordStatusView, SyncStatus};
