//! Sync record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::{BatchId, RecordId, SyncStatus, UserId};
use crate::error::{Error, Result};

const MAX_ENTITY_TYPE_LEN: usize = 64;

/// Payload discriminator, e.g. `species`, `fossil`, `collection`
///
/// A lowercase slug: starts with a letter, then letters, digits, `_` or `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        let mut chars = value.chars();
        let valid = value.len() <= MAX_ENTITY_TYPE_LEN
            && chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidRecord(format!(
                "entity type '{value}' is not a valid slug"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A record submitted by a client; status and placement are engine-owned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: RecordId,
    pub user_id: UserId,
    pub entity_type: EntityType,
    pub data: serde_json::Value,
    pub version: i64,
}

/// A record as persisted in the relational store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Idempotency key; write-once
    pub id: RecordId,
    /// Owner; shard key
    pub user_id: UserId,
    pub batch_id: BatchId,
    pub entity_type: EntityType,
    pub status: SyncStatus,
    /// Opaque payload
    pub data: serde_json::Value,
    /// Retries performed, capped at the configured maximum
    pub retry_count: u32,
    /// Last failure reason, only for `failed` and `conflict`
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Client edit generation used for optimistic concurrency
    pub version: i64,
    /// Assigned by the shard router at write time
    pub shard_id: u32,
}

impl SyncRecord {
    /// Build a pending record from a client request; `shard_id` is set by the writer.
    pub fn from_request(request: SyncRequest, batch_id: BatchId) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            user_id: request.user_id,
            batch_id,
            entity_type: request.entity_type,
            status: SyncStatus::Pending,
            data: request.data,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: request.version,
            shard_id: 0,
        }
    }

    /// Reject records that must never reach the database.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::InvalidRecord("record id must not be nil".into()));
        }
        if self.user_id.is_nil() {
            return Err(Error::InvalidRecord(format!(
                "record {} has a nil user id",
                self.id
            )));
        }
        if self.batch_id.is_nil() {
            return Err(Error::InvalidRecord(format!(
                "record {} has a nil batch id",
                self.id
            )));
        }
        if self.version < 0 {
            return Err(Error::InvalidRecord(format!(
                "record {} has negative version {}",
                self.id, self.version
            )));
        }
        if self.data.is_null() {
            return Err(Error::InvalidRecord(format!(
                "record {} has no payload",
                self.id
            )));
        }
        Ok(())
    }

    /// Hex SHA-256 of the serialized payload
    pub fn payload_hash(&self) -> String {
        payload_hash(&self.data)
    }
}

/// Hex SHA-256 of a JSON payload.
///
/// `serde_json` keeps object keys sorted, so equal values hash equally.
pub fn payload_hash(data: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> SyncRequest {
        SyncRequest {
            id: RecordId::new(),
            user_id: UserId::new(),
            entity_type: EntityType::parse("species").unwrap(),
            data: json!({"name": "Trilobite"}),
            version: 1,
        }
    }

    #[test]
    fn entity_type_normalizes_and_rejects_garbage() {
        assert_eq!(EntityType::parse(" Fossil ").unwrap().as_str(), "fossil");
        assert!(EntityType::parse("").is_err());
        assert!(EntityType::parse("9lives").is_err());
        assert!(EntityType::parse("drop table").is_err());
        assert!(EntityType::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn entity_type_deserialization_validates() {
        let err = serde_json::from_str::<EntityType>("\"bad type\"");
        assert!(err.is_err());
        let ok: EntityType = serde_json::from_str("\"collection\"").unwrap();
        assert_eq!(ok.as_str(), "collection");
    }

    #[test]
    fn from_request_starts_pending() {
        let record = SyncRecord::from_request(request(), BatchId::new());
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn validate_rejects_negative_version_and_null_payload() {
        let mut record = SyncRecord::from_request(request(), BatchId::new());
        record.version = -1;
        assert!(matches!(record.validate(), Err(Error::InvalidRecord(_))));

        let mut record = SyncRecord::from_request(request(), BatchId::new());
        record.data = serde_json::Value::Null;
        assert!(matches!(record.validate(), Err(Error::InvalidRecord(_))));
    }

    #[test]
    fn payload_hash_ignores_key_order() {
        let a = json!({"genus": "Paradoxides", "age": 500});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"age": 500, "genus": "Paradoxides"}"#).unwrap();
        assert_eq!(payload_hash(&a), payload_hash(&b));
        assert_ne!(payload_hash(&a), payload_hash(&json!({"genus": "Olenellus"})));
        assert_eq!(payload_hash(&a).len(), 64);
    }
}
