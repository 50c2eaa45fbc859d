//! In-process store for tests and local experiments

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{Expected, StoreConnection, StoreConnector};
use crate::config::HostSpec;
use crate::error::{Error, Result};
use crate::models::{BatchId, RecordId, SyncRecord};

/// Injected failure for the next operation on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Lock or serialization failure; retryable
    Transient,
    /// Dropped connection; retryable
    ConnectionReset,
    /// Rejected by the database; not retryable
    Constraint,
    /// Never completes
    Hang,
}

#[derive(Default)]
struct Table {
    records: HashMap<RecordId, SyncRecord>,
    heartbeat: Option<DateTime<Utc>>,
}

type Interleave = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HostState {
    scripted: Mutex<VecDeque<Option<Fault>>>,
    after_load: Mutex<Option<Interleave>>,
    always: Mutex<Option<Fault>>,
    unreachable: AtomicBool,
    lag: Mutex<Option<Option<Duration>>>,
    operations: AtomicU64,
    connects: AtomicU64,
}

/// Handle to one simulated database host
///
/// Clones share the same host. [`MemoryHost::mirror`] creates a replica that
/// sees the primary's data immediately; [`MemoryHost::new`] creates an
/// independent database, which behaves like a replica that never caught up.
#[derive(Clone, Default)]
pub struct MemoryHost {
    table: Arc<RwLock<Table>>,
    state: Arc<HostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second host that shares this host's data
    #[must_use]
    pub fn mirror(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            state: Arc::new(HostState::default()),
        }
    }

    /// Fail the next operations, in order
    pub fn fail_next(&self, faults: impl IntoIterator<Item = Fault>) {
        self.state.scripted.lock().extend(faults.into_iter().map(Some));
    }

    /// Let `skip` operations through, then fail one with `fault`
    pub fn fail_after(&self, skip: usize, fault: Fault) {
        let mut scripted = self.state.scripted.lock();
        scripted.extend(std::iter::repeat(None).take(skip));
        scripted.push_back(Some(fault));
    }

    /// Fail every operation until cleared with `None`
    pub fn fail_always(&self, fault: Option<Fault>) {
        *self.state.always.lock() = fault;
    }

    /// Run `action` right after the next `load_record` has read its row,
    /// as if another writer committed between the read and the write.
    pub fn interleave_after_next_load(&self, action: impl FnOnce() + Send + 'static) {
        *self.state.after_load.lock() = Some(Box::new(action));
    }

    /// Refuse new connections
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Report a fixed replication lag instead of the heartbeat age;
    /// `Some(None)` reports the lag as unknown
    pub fn set_lag(&self, lag: Option<Option<Duration>>) {
        *self.state.lag.lock() = lag;
    }

    /// Statements executed against this host, excluding rollbacks
    pub fn operations(&self) -> u64 {
        self.state.operations.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Committed row for `id`
    pub fn record(&self, id: &RecordId) -> Option<SyncRecord> {
        self.table.read().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a row directly, bypassing transactions
    pub fn seed(&self, record: SyncRecord) {
        self.table.write().records.insert(record.id, record);
    }

    fn next_fault(&self) -> Option<Fault> {
        if let Some(scripted) = self.state.scripted.lock().pop_front() {
            return scripted;
        }
        *self.state.always.lock()
    }
}

/// Connector over a set of named [`MemoryHost`]s, keyed by [`HostSpec::name`]
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hosts: Arc<RwLock<HashMap<String, MemoryHost>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `host` under `name`; returns its spec (`memory://name`)
    pub fn add_host(&self, name: &str, host: MemoryHost) -> HostSpec {
        self.hosts.write().insert(name.to_string(), host);
        HostSpec::new(format!("memory://{name}"))
    }

    pub fn host(&self, name: &str) -> Option<MemoryHost> {
        self.hosts.read().get(name).cloned()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, spec: &HostSpec) -> Result<Box<dyn StoreConnection>> {
        let host = self
            .host(&spec.name)
            .ok_or_else(|| Error::connection(&spec.name, "unknown host"))?;
        if host.state.unreachable.load(Ordering::SeqCst) {
            return Err(Error::connection(&spec.name, "connection refused"));
        }
        host.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            name: spec.name.clone(),
            host,
            staged: None,
        }))
    }
}

enum Guard {
    Absent,
    Matches(Expected),
}

struct StagedWrite {
    record: SyncRecord,
    guard: Guard,
}

struct MemoryConnection {
    name: String,
    host: MemoryHost,
    staged: Option<Vec<StagedWrite>>,
}

impl MemoryConnection {
    async fn touch(&self) -> Result<()> {
        self.host.state.operations.fetch_add(1, Ordering::SeqCst);
        match self.host.next_fault() {
            None => Ok(()),
            Some(Fault::Transient) => Err(Error::Transient("database is locked".into())),
            Some(Fault::ConnectionReset) => {
                Err(Error::connection(&self.name, "connection reset by peer"))
            }
            Some(Fault::Constraint) => Err(Error::Constraint("CHECK constraint failed".into())),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }

    /// Row as seen by this connection: staged writes first, then the table
    fn visible(&self, id: &RecordId) -> Option<SyncRecord> {
        if let Some(staged) = &self.staged {
            if let Some(write) = staged.iter().rev().find(|write| write.record.id == *id) {
                return Some(write.record.clone());
            }
        }
        self.host.record(id)
    }

    fn apply(&mut self, record: &SyncRecord, guard: Guard) -> Result<()> {
        match &mut self.staged {
            Some(staged) => {
                staged.push(StagedWrite {
                    record: record.clone(),
                    guard,
                });
                Ok(())
            }
            None => {
                let mut table = self.host.table.write();
                check_guard(&table, record, &guard)?;
                table.records.insert(record.id, record.clone());
                Ok(())
            }
        }
    }
}

fn check_guard(table: &Table, record: &SyncRecord, guard: &Guard) -> Result<()> {
    let current = table.records.get(&record.id);
    let ok = match (guard, current) {
        (Guard::Absent, None) => true,
        (Guard::Matches(expected), Some(row)) => {
            row.version == expected.version && row.status == expected.status
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Contention(format!(
            "record {} changed by a concurrent writer",
            record.id
        )))
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.touch().await
    }

    async fn begin(&mut self) -> Result<()> {
        self.touch().await?;
        if self.staged.is_some() {
            return Err(Error::Database("transaction already open".into()));
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.touch().await?;
        let staged = self
            .staged
            .take()
            .ok_or_else(|| Error::Database("no transaction is open".into()))?;
        let mut table = self.host.table.write();
        // First write per id carries the guard against committed state.
        let mut checked = Vec::new();
        for write in &staged {
            if !checked.contains(&write.record.id) {
                check_guard(&table, &write.record, &write.guard)?;
                checked.push(write.record.id);
            }
        }
        for write in staged {
            table.records.insert(write.record.id, write.record);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged = None;
        Ok(())
    }

    async fn load_record(&mut self, id: &RecordId) -> Result<Option<SyncRecord>> {
        self.touch().await?;
        let row = self.visible(id);
        let interleave = self.host.state.after_load.lock().take();
        if let Some(action) = interleave {
            action();
        }
        Ok(row)
    }

    async fn load_batch(&mut self, batch_id: &BatchId) -> Result<Vec<SyncRecord>> {
        self.touch().await?;
        let mut records: Vec<SyncRecord> = self
            .host
            .table
            .read()
            .records
            .values()
            .filter(|record| record.batch_id == *batch_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn insert_record(&mut self, record: &SyncRecord) -> Result<()> {
        self.touch().await?;
        if self.visible(&record.id).is_some() {
            return Err(Error::Contention(format!(
                "UNIQUE constraint failed: sync_records.id ({})",
                record.id
            )));
        }
        self.apply(record, Guard::Absent)
    }

    async fn update_record(&mut self, record: &SyncRecord, expected: Expected) -> Result<u64> {
        self.touch().await?;
        let Some(current) = self.visible(&record.id) else {
            return Ok(0);
        };
        if current.version != expected.version || current.status != expected.status {
            return Ok(0);
        }
        let mut updated = record.clone();
        updated.user_id = current.user_id;
        updated.entity_type = current.entity_type;
        updated.created_at = current.created_at;
        match self.apply(&updated, Guard::Matches(expected)) {
            Ok(()) => Ok(1),
            Err(Error::Contention(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    async fn replication_lag(&mut self) -> Result<Option<Duration>> {
        self.touch().await?;
        if let Some(lag) = *self.host.state.lag.lock() {
            return Ok(lag);
        }
        let heartbeat = self.host.table.read().heartbeat;
        Ok(heartbeat.map(|beat| (Utc::now() - beat).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn write_heartbeat(&mut self) -> Result<()> {
        self.touch().await?;
        self.host.table.write().heartbeat = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, SyncStatus, UserId};
    use serde_json::json;

    fn record() -> SyncRecord {
        let now = Utc::now();
        SyncRecord {
            id: RecordId::new(),
            user_id: UserId::new(),
            batch_id: BatchId::new(),
            entity_type: EntityType::parse("species").unwrap(),
            status: SyncStatus::Committed,
            data: json!({"name": "Hallucigenia"}),
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            version: 1,
            shard_id: 0,
        }
    }

    async fn connect(connector: &MemoryConnector, spec: &HostSpec) -> Box<dyn StoreConnection> {
        connector.connect(spec).await.unwrap()
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_to_others() {
        let connector = MemoryConnector::new();
        let spec = connector.add_host("primary", MemoryHost::new());
        let mut writer = connect(&connector, &spec).await;
        let mut reader = connect(&connector, &spec).await;

        let row = record();
        writer.begin().await.unwrap();
        writer.insert_record(&row).await.unwrap();
        assert!(writer.load_record(&row.id).await.unwrap().is_some());
        assert!(reader.load_record(&row.id).await.unwrap().is_none());

        writer.commit().await.unwrap();
        assert!(reader.load_record(&row.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let connector = MemoryConnector::new();
        let host = MemoryHost::new();
        let spec = connector.add_host("primary", host.clone());
        let row = record();
        {
            let mut conn = connect(&connector, &spec).await;
            conn.begin().await.unwrap();
            conn.insert_record(&row).await.unwrap();
        }
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn racing_inserts_conflict_at_commit() {
        let connector = MemoryConnector::new();
        let spec = connector.add_host("primary", MemoryHost::new());
        let mut first = connect(&connector, &spec).await;
        let mut second = connect(&connector, &spec).await;
        let row = record();

        first.begin().await.unwrap();
        second.begin().await.unwrap();
        first.insert_record(&row).await.unwrap();
        second.insert_record(&row).await.unwrap();
        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(Error::Contention(_))));
    }

    #[tokio::test]
    async fn update_is_guarded_by_version_and_status() {
        let connector = MemoryConnector::new();
        let host = MemoryHost::new();
        let spec = connector.add_host("primary", host.clone());
        let row = record();
        host.seed(row.clone());

        let mut conn = connect(&connector, &spec).await;
        let mut newer = row.clone();
        newer.version = 2;
        let stale = Expected {
            version: 0,
            status: SyncStatus::Committed,
        };
        assert_eq!(conn.update_record(&newer, stale).await.unwrap(), 0);
        assert_eq!(conn.update_record(&newer, Expected::of(&row)).await.unwrap(), 1);
        assert_eq!(host.record(&row.id).unwrap().version, 2);
    }

    #[tokio::test]
    async fn scripted_faults_fire_in_order() {
        let connector = MemoryConnector::new();
        let host = MemoryHost::new();
        let spec = connector.add_host("primary", host.clone());
        let mut conn = connect(&connector, &spec).await;

        host.fail_next([Fault::Transient, Fault::ConnectionReset]);
        assert!(matches!(conn.ping().await, Err(Error::Transient(_))));
        assert!(matches!(conn.ping().await, Err(Error::Connection { .. })));
        assert!(conn.ping().await.is_ok());
        assert_eq!(host.operations(), 3);
    }

    #[tokio::test]
    async fn unreachable_host_refuses_connections() {
        let connector = MemoryConnector::new();
        let host = MemoryHost::new();
        let spec = connector.add_host("primary", host.clone());
        host.set_unreachable(true);
        assert!(matches!(
            connector.connect(&spec).await,
            Err(Error::Connection { .. })
        ));
        assert!(matches!(
            connector.connect(&HostSpec::new("memory://nowhere")).await,
            Err(Error::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn lag_follows_heartbeat_unless_overridden() {
        let connector = MemoryConnector::new();
        let primary = MemoryHost::new();
        let primary_spec = connector.add_host("primary", primary.clone());
        let mirror_spec = connector.add_host("mirror", primary.mirror());
        let stale_spec = connector.add_host("stale", MemoryHost::new());

        let mut conn = connect(&connector, &primary_spec).await;
        conn.write_heartbeat().await.unwrap();

        let mut mirror = connect(&connector, &mirror_spec).await;
        let lag = mirror.replication_lag().await.unwrap().unwrap();
        assert!(lag < Duration::from_secs(1));

        let mut stale = connect(&connector, &stale_spec).await;
        assert_eq!(stale.replication_lag().await.unwrap(), None);

        connector
            .host("mirror")
            .unwrap()
            .set_lag(Some(Some(Duration::from_secs(30))));
        assert_eq!(
            mirror.replication_lag().await.unwrap(),
            Some(Duration::from_secs(30))
        );
    }
}
