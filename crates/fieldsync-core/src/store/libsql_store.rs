//! libSQL backend

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Row, Value};
use parking_lot::Mutex;

use super::{Expected, StoreConnection, StoreConnector};
use crate::config::HostSpec;
use crate::error::{is_retryable_message, is_unique_violation, Error, Result};
use crate::models::{BatchId, EntityType, RecordId, SyncRecord};

const SELECT_COLUMNS: &str = "id, user_id, batch_id, entity_type, status, data, retry_count, \
     error_message, created_at, updated_at, version, shard_id";

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS sync_records (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        status TEXT NOT NULL,
        data TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        version INTEGER NOT NULL,
        shard_id INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_records_user_shard ON sync_records(user_id, shard_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_records_batch ON sync_records(batch_id)",
    "CREATE TABLE IF NOT EXISTS replication_heartbeat (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        beat_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(status)",
];

/// Opens libSQL databases: local paths (`file:` prefix optional) or remote
/// `libsql://` / `http(s)://` servers.
///
/// One database handle is kept per host; each `connect` opens a fresh
/// connection on it. The schema is created on first open.
#[derive(Default)]
pub struct LibSqlConnector {
    databases: Mutex<HashMap<String, Arc<Database>>>,
}

impl LibSqlConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn database(&self, host: &HostSpec) -> Result<Arc<Database>> {
        let cached = self.databases.lock().get(&host.name).cloned();
        if let Some(db) = cached {
            return Ok(db);
        }

        let built = if host.is_remote() {
            let token = host.auth_token.clone().unwrap_or_default();
            Builder::new_remote(host.url.clone(), token).build().await
        } else {
            Builder::new_local(host.url.trim_start_matches("file:"))
                .build()
                .await
        };
        let db = Arc::new(built.map_err(|err| Error::connection(&host.name, err))?);

        let conn = db.connect().map_err(|err| Error::connection(&host.name, err))?;
        configure(&conn, host.is_remote()).await;
        migrate(&conn, &host.name).await;

        let mut databases = self.databases.lock();
        let db = databases.entry(host.name.clone()).or_insert(db);
        Ok(Arc::clone(db))
    }
}

async fn configure(conn: &Connection, remote: bool) {
    if remote {
        return;
    }
    // Pragmas are advisory; the store works without them.
    conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
    conn.execute("PRAGMA synchronous = NORMAL;", ()).await.ok();
}

/// Create the engine's tables. Read-only replicas reject DDL, which is fine
/// as long as the primary has created the schema.
async fn migrate(conn: &Connection, host: &str) {
    for statement in SCHEMA {
        if let Err(err) = conn.execute(statement, ()).await {
            tracing::warn!(host, error = %err, "Schema statement failed");
            return;
        }
    }
}

#[async_trait]
impl StoreConnector for LibSqlConnector {
    async fn connect(&self, host: &HostSpec) -> Result<Box<dyn StoreConnection>> {
        let db = self.database(host).await?;
        let conn = db.connect().map_err(|err| Error::connection(&host.name, err))?;
        if !host.is_remote() {
            conn.execute("PRAGMA busy_timeout = 5000;", ()).await.ok();
        }
        Ok(Box::new(LibSqlConnection { conn }))
    }
}

struct LibSqlConnection {
    conn: Connection,
}

/// Sort driver errors into the engine's retry classes.
fn classify(err: libsql::Error) -> Error {
    let message = err.to_string();
    if is_unique_violation(&message) {
        Error::Contention(message)
    } else if is_retryable_message(&message) {
        Error::Transient(message)
    } else {
        Error::LibSql(err)
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Database(format!("timestamp {ms} out of range")))
}

fn parse_row(row: &Row) -> Result<SyncRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let batch_id: String = row.get(2)?;
    let entity_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let data: String = row.get(5)?;
    let retry_count: i64 = row.get(6)?;
    let error_message = match row.get_value(7)? {
        Value::Text(text) => Some(text),
        _ => None,
    };
    let shard_id: i64 = row.get(11)?;

    let corrupt = |what: &str| Error::Database(format!("stored {what} for record {id} is invalid"));
    Ok(SyncRecord {
        id: id.parse().map_err(|_| corrupt("id"))?,
        user_id: user_id.parse().map_err(|_| corrupt("user id"))?,
        batch_id: batch_id.parse().map_err(|_| corrupt("batch id"))?,
        entity_type: EntityType::parse(&entity_type).map_err(|_| corrupt("entity type"))?,
        status: status.parse()?,
        data: serde_json::from_str(&data)?,
        retry_count: u32::try_from(retry_count).map_err(|_| corrupt("retry count"))?,
        error_message,
        created_at: from_millis(row.get(8)?)?,
        updated_at: from_millis(row.get(9)?)?,
        version: row.get(10)?,
        shard_id: u32::try_from(shard_id).map_err(|_| corrupt("shard id"))?,
    })
}

#[async_trait]
impl StoreConnection for LibSqlConnection {
    async fn ping(&mut self) -> Result<()> {
        let mut rows = self.conn.query("SELECT 1", ()).await.map_err(classify)?;
        rows.next().await.map_err(classify)?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.conn.execute("COMMIT", ()).await.map_err(classify)?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.conn.execute("ROLLBACK", ()).await.map_err(classify)?;
        Ok(())
    }

    async fn load_record(&mut self, id: &RecordId) -> Result<Option<SyncRecord>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_records WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, [id.as_str()])
            .await
            .map_err(classify)?;
        match rows.next().await.map_err(classify)? {
            Some(row) => Ok(Some(parse_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn load_batch(&mut self, batch_id: &BatchId) -> Result<Vec<SyncRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM sync_records WHERE batch_id = ?1 ORDER BY created_at, id"
        );
        let mut rows = self
            .conn
            .query(&sql, [batch_id.as_str()])
            .await
            .map_err(classify)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(classify)? {
            records.push(parse_row(&row)?);
        }
        Ok(records)
    }

    async fn insert_record(&mut self, record: &SyncRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        self.conn
            .execute(
                "INSERT INTO sync_records (id, user_id, batch_id, entity_type, status, data, \
                 retry_count, error_message, created_at, updated_at, version, shard_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                libsql::params![
                    record.id.as_str(),
                    record.user_id.as_str(),
                    record.batch_id.as_str(),
                    record.entity_type.as_str(),
                    record.status.as_str(),
                    data,
                    i64::from(record.retry_count),
                    record.error_message.clone(),
                    millis(record.created_at),
                    millis(record.updated_at),
                    record.version,
                    i64::from(record.shard_id),
                ],
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update_record(&mut self, record: &SyncRecord, expected: Expected) -> Result<u64> {
        let data = serde_json::to_string(&record.data)?;
        let changed = self
            .conn
            .execute(
                "UPDATE sync_records SET batch_id = ?1, status = ?2, data = ?3, retry_count = ?4, \
                 error_message = ?5, updated_at = ?6, version = ?7, shard_id = ?8 \
                 WHERE id = ?9 AND version = ?10 AND status = ?11",
                libsql::params![
                    record.batch_id.as_str(),
                    record.status.as_str(),
                    data,
                    i64::from(record.retry_count),
                    record.error_message.clone(),
                    millis(record.updated_at),
                    record.version,
                    i64::from(record.shard_id),
                    record.id.as_str(),
                    expected.version,
                    expected.status.as_str(),
                ],
            )
            .await
            .map_err(classify)?;
        Ok(changed)
    }

    async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        let mut rows = self
            .conn
            .query("SELECT beat_at FROM replication_heartbeat WHERE id = 1", ())
            .await
            .map_err(classify)?;
        let Some(row) = rows.next().await.map_err(classify)? else {
            return Ok(None);
        };
        let beat_at = from_millis(row.get(0)?)?;
        Ok(Some((Utc::now() - beat_at).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn write_heartbeat(&mut self) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO replication_heartbeat (id, beat_at) VALUES (1, ?1) \
                 ON CONFLICT(id) DO UPDATE SET beat_at = excluded.beat_at",
                [millis(Utc::now())],
            )
            .await
            .map_err(classify)?;
        Ok(())
    }
}
