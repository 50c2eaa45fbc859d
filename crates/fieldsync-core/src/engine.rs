//! Sync engine
//!
//! Ties the router, pools, breaker, writer and reader together. Batches are
//! written concurrently, bounded by `max_concurrent_writes` across the whole
//! engine. Records that are accepted but not yet settled are tracked in
//! memory so status queries can report them before they reach the database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsReporter;
use crate::models::{
    BatchId, BatchReport, BatchStatusView, ReadSource, RecordId, RecordOutcome, RecordStatusView,
    SyncBatch, SyncRecord, SyncRequest, SyncStatus,
};
use crate::pool::{PoolManager, PoolStatus};
use crate::reader::{ReplicaReader, Sourced};
use crate::shard::ShardRouter;
use crate::store::StoreConnector;
use crate::writer::{TransactionalWriter, WriteOutcome, WriteReceipt};

const WRITE_BREAKER: &str = "sync_writes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Liveness summary for the health endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub primary: String,
    pub replicas: Vec<String>,
    pub configured_replicas: usize,
    pub breaker: BreakerSnapshot,
    pub pools: Vec<PoolStatus>,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    ticket: u64,
    batch_id: BatchId,
    status: SyncStatus,
    version: i64,
    updated_at: DateTime<Utc>,
    /// Set when a deadline cut the write off and no task owns the entry
    abandoned_at: Option<Instant>,
}

impl Tracked {
    /// Whether this submission is newer than what the database holds
    fn supersedes(&self, stored: &SyncRecord) -> bool {
        self.version > stored.version
            || (stored.status == SyncStatus::Failed && self.version >= stored.version)
    }

    fn view(&self, id: RecordId) -> RecordStatusView {
        RecordStatusView {
            id,
            batch_id: self.batch_id,
            status: self.status,
            version: self.version,
            error_message: None,
            retry_count: 0,
            updated_at: self.updated_at,
            source: ReadSource::InFlight,
        }
    }
}

/// Replayed records acknowledged under a batch other than the one they are
/// stored with
#[derive(Debug)]
struct Replayed {
    ids: Vec<RecordId>,
    at: Instant,
}

struct Entries {
    records: HashMap<RecordId, Tracked>,
    replays: HashMap<BatchId, Replayed>,
    next_sweep: Instant,
}

/// Records accepted by this process and not yet settled.
///
/// Each submission gets a ticket; only the holder of the current ticket for
/// an id may update or clear its entry, so a late finisher never erases a
/// newer submission of the same record. Entries left behind by a deadline
/// and replay membership expire after `retention`.
struct InFlightTracker {
    entries: Mutex<Entries>,
    next_ticket: AtomicU64,
    retention: Duration,
}

impl InFlightTracker {
    fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(Entries {
                records: HashMap::new(),
                replays: HashMap::new(),
                next_sweep: Instant::now() + retention,
            }),
            next_ticket: AtomicU64::new(0),
            retention,
        }
    }

    fn expired(&self, entry: &Tracked, now: Instant) -> bool {
        entry
            .abandoned_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.retention)
    }

    fn sweep(&self, entries: &mut Entries, now: Instant) {
        if now < entries.next_sweep {
            return;
        }
        entries.records.retain(|_, entry| !self.expired(entry, now));
        entries
            .replays
            .retain(|_, replayed| now.saturating_duration_since(replayed.at) < self.retention);
        entries.next_sweep = now + self.retention / 4;
    }

    fn register(&self, record: &SyncRecord) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        self.sweep(&mut entries, Instant::now());
        entries.records.insert(
            record.id,
            Tracked {
                ticket,
                batch_id: record.batch_id,
                status: SyncStatus::Pending,
                version: record.version,
                updated_at: Utc::now(),
                abandoned_at: None,
            },
        );
        ticket
    }

    fn set_status(&self, id: &RecordId, ticket: u64, status: SyncStatus) {
        if let Some(entry) = self.entries.lock().records.get_mut(id) {
            if entry.ticket == ticket {
                entry.status = status;
                entry.updated_at = Utc::now();
            }
        }
    }

    /// Leave the entry `pending` with no owner; it expires unless the record
    /// is submitted again.
    fn abandon(&self, id: &RecordId, ticket: u64) {
        if let Some(entry) = self.entries.lock().records.get_mut(id) {
            if entry.ticket == ticket {
                entry.status = SyncStatus::Pending;
                entry.updated_at = Utc::now();
                entry.abandoned_at = Some(Instant::now());
            }
        }
    }

    fn finish(&self, id: &RecordId, ticket: u64) {
        let mut entries = self.entries.lock();
        if entries
            .records
            .get(id)
            .is_some_and(|entry| entry.ticket == ticket)
        {
            entries.records.remove(id);
        }
    }

    fn note_replay(&self, batch_id: BatchId, id: RecordId) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let replayed = entries.replays.entry(batch_id).or_insert_with(|| Replayed {
            ids: Vec::new(),
            at: now,
        });
        if !replayed.ids.contains(&id) {
            replayed.ids.push(id);
        }
        replayed.at = now;
    }

    fn replayed_in(&self, batch_id: &BatchId) -> Vec<RecordId> {
        let now = Instant::now();
        self.entries
            .lock()
            .replays
            .get(batch_id)
            .filter(|replayed| now.saturating_duration_since(replayed.at) < self.retention)
            .map(|replayed| replayed.ids.clone())
            .unwrap_or_default()
    }

    fn get(&self, id: &RecordId) -> Option<Tracked> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep(&mut entries, now);
        entries
            .records
            .get(id)
            .filter(|entry| !self.expired(entry, now))
            .cloned()
    }

    fn in_batch(&self, batch_id: &BatchId) -> HashMap<RecordId, Tracked> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep(&mut entries, now);
        entries
            .records
            .iter()
            .filter(|(_, entry)| entry.batch_id == *batch_id && !self.expired(entry, now))
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        self.sweep(&mut entries, now);
        entries
            .records
            .values()
            .filter(|entry| !self.expired(entry, now))
            .count()
    }
}

/// Clears a tracker entry when the write settles or its future is dropped
struct Settle<'a> {
    tracker: &'a InFlightTracker,
    id: RecordId,
    ticket: u64,
    keep: bool,
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.keep {
            self.tracker.finish(&self.id, self.ticket);
        }
    }
}

/// State shared with dispatched write tasks
struct Dispatcher {
    writer: TransactionalWriter,
    tracker: InFlightTracker,
    permits: Semaphore,
}

impl Dispatcher {
    /// Wait for a write slot, then write. A deadline covers both.
    ///
    /// On expiry the record stays `pending` in the tracker; every other
    /// result, and dropping this future, clears it.
    async fn execute(
        &self,
        record: SyncRecord,
        ticket: u64,
        deadline: Option<Deadline>,
    ) -> Result<WriteReceipt> {
        let (id, batch_id) = (record.id, record.batch_id);
        let mut settle = Settle {
            tracker: &self.tracker,
            id,
            ticket,
            keep: false,
        };
        let work = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| Error::connection("dispatcher", "engine is shut down"))?;
            self.tracker.set_status(&id, ticket, SyncStatus::Processing);
            self.writer.write(record).await
        };

        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.at, work)
                .await
                .unwrap_or_else(|_| Err(Error::DeadlineExceeded(deadline.budget))),
            None => work.await,
        };

        match &result {
            Err(Error::DeadlineExceeded(budget)) => {
                tracing::warn!(record_id = %id, ?budget, "Write deadline exceeded; record left pending");
                self.tracker.abandon(&id, ticket);
                settle.keep = true;
            }
            Ok(receipt) if matches!(receipt.outcome, WriteOutcome::Replayed { .. }) => {
                self.tracker.note_replay(batch_id, id);
            }
            _ => {}
        }
        result
    }
}

fn outcome_of(id: RecordId, version: i64, result: Result<WriteReceipt>) -> RecordOutcome {
    match result {
        Ok(receipt) => RecordOutcome {
            id,
            status: receipt.outcome.status(),
            version: match receipt.outcome {
                WriteOutcome::Replayed { stored_version } => stored_version,
                WriteOutcome::Inserted | WriteOutcome::Updated { .. } => version,
            },
            error_message: None,
        },
        Err(err) => {
            let (status, version) = match &err {
                Error::Conflict { stored_version, .. } => (SyncStatus::Conflict, *stored_version),
                Error::DeadlineExceeded(_) => (SyncStatus::Pending, version),
                _ => (SyncStatus::Failed, version),
            };
            RecordOutcome {
                id,
                status,
                version,
                error_message: Some(err.root().to_string()),
            }
        }
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    pools: Arc<PoolManager>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsReporter>,
    reader: ReplicaReader,
    dispatcher: Arc<Dispatcher>,
    closing: AtomicBool,
    stop: watch::Sender<bool>,
}

impl SyncEngine {
    /// Build every component and open the pools.
    ///
    /// Fails when the configuration is unusable or the primary is
    /// unreachable.
    pub async fn connect(config: EngineConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        let router = ShardRouter::new(config.shard_count)?;
        config.check_hosts()?;
        if config.max_concurrent_writes == 0 {
            return Err(Error::Configuration(
                "max concurrent writes must be at least 1".to_string(),
            ));
        }

        let metrics = Arc::new(MetricsReporter::new(config.shard_count));
        let breaker = Arc::new(CircuitBreaker::new(
            WRITE_BREAKER,
            config.breaker.clone(),
            Arc::clone(&metrics),
        ));
        let pools = Arc::new(PoolManager::connect(&config, connector).await?);
        let writer = TransactionalWriter::new(
            Arc::clone(&pools),
            router,
            Arc::clone(&breaker),
            Arc::clone(&metrics),
            config.writer.clone(),
        );
        let reader = ReplicaReader::new(
            Arc::clone(&pools),
            Arc::clone(&metrics),
            config.max_replica_lag,
            config.writer.query_timeout,
        );
        let dispatcher = Arc::new(Dispatcher {
            writer,
            tracker: InFlightTracker::new(config.status_retention),
            permits: Semaphore::new(config.max_concurrent_writes),
        });

        tracing::info!(
            shards = config.shard_count,
            replicas = pools.active_replicas().len(),
            max_concurrent_writes = config.max_concurrent_writes,
            "Sync engine ready"
        );

        let (stop, _) = watch::channel(false);
        Ok(Self {
            config,
            pools,
            breaker,
            metrics,
            reader,
            dispatcher,
            closing: AtomicBool::new(false),
            stop,
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Write every record of `batch` and report each outcome in submission
    /// order.
    ///
    /// Only a malformed batch is an error; per-record failures, conflicts and
    /// deadline cut-offs are reported in the outcomes.
    pub async fn submit_batch(
        &self,
        batch: SyncBatch,
        deadline: Option<Duration>,
    ) -> Result<BatchReport> {
        self.ensure_open()?;
        batch.validate(self.config.max_batch_size)?;

        let batch_id = batch.batch_id;
        let total = batch.records.len();
        let span = tracing::info_span!("sync_batch", batch_id = %batch_id, records = total);
        let deadline = deadline.map(Deadline::after);

        async move {
            let mut tasks = JoinSet::new();
            let mut submitted = Vec::with_capacity(total);
            for (index, request) in batch.records.into_iter().enumerate() {
                let record = SyncRecord::from_request(request, batch_id);
                let ticket = self.dispatcher.tracker.register(&record);
                submitted.push((record.id, record.version));
                let dispatcher = Arc::clone(&self.dispatcher);
                tasks.spawn(
                    async move {
                        let (id, version) = (record.id, record.version);
                        let result = dispatcher.execute(record, ticket, deadline).await;
                        (index, outcome_of(id, version, result))
                    }
                    .in_current_span(),
                );
            }

            let mut outcomes: Vec<Option<RecordOutcome>> = vec![None; total];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => outcomes[index] = Some(outcome),
                    Err(err) => tracing::error!(error = %err, "Write task aborted"),
                }
            }

            let outcomes: Vec<RecordOutcome> = outcomes
                .into_iter()
                .zip(submitted)
                .map(|(outcome, (id, version))| {
                    outcome.unwrap_or_else(|| RecordOutcome {
                        id,
                        status: SyncStatus::Failed,
                        version,
                        error_message: Some("write task aborted".to_string()),
                    })
                })
                .collect();
            let report = BatchReport::from_outcomes(batch_id, outcomes);
            tracing::info!(
                committed = report.committed,
                conflicts = report.conflicts,
                failed = report.failed,
                pending = report.pending,
                "Batch processed"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Write a single record, surfacing its error directly.
    pub async fn submit_record(
        &self,
        request: SyncRequest,
        batch_id: Option<BatchId>,
        deadline: Option<Duration>,
    ) -> Result<WriteReceipt> {
        self.ensure_open()?;
        let record = SyncRecord::from_request(request, batch_id.unwrap_or_default());
        let ticket = self.dispatcher.tracker.register(&record);
        self.dispatcher
            .execute(record, ticket, deadline.map(Deadline::after))
            .await
    }

    /// Current status of one record.
    ///
    /// A submission still in flight wins over an older stored row. If the
    /// store cannot be read, an in-flight entry is still reported.
    pub async fn record_status(&self, id: &RecordId) -> Result<RecordStatusView> {
        let tracked = self.dispatcher.tracker.get(id);
        let stored = match self.reader.record(id).await {
            Ok(stored) => stored,
            Err(err) => {
                return match tracked {
                    Some(entry) => Ok(self.in_flight_view(&entry, *id)),
                    None => Err(err),
                };
            }
        };

        match (stored.value, tracked) {
            (Some(record), Some(entry)) if entry.supersedes(&record) => {
                Ok(self.in_flight_view(&entry, *id))
            }
            (Some(record), _) => Ok(RecordStatusView::from_record(&record, stored.source)),
            (None, Some(entry)) => Ok(self.in_flight_view(&entry, *id)),
            (None, None) => Err(Error::NotFound(format!("record {id}"))),
        }
    }

    /// Status of every record submitted under `batch_id`.
    ///
    /// Records this batch only replayed are stored under the batch that first
    /// wrote them; they are looked up one by one and reported as stored.
    pub async fn batch_status(&self, batch_id: &BatchId) -> Result<BatchStatusView> {
        let mut tracked = self.dispatcher.tracker.in_batch(batch_id);
        let replayed = self.dispatcher.tracker.replayed_in(batch_id);
        let stored = match self.reader.batch(batch_id).await {
            Ok(stored) => Some(stored),
            Err(err) if tracked.is_empty() && replayed.is_empty() => return Err(err),
            Err(err) => {
                tracing::warn!(batch_id = %batch_id, error = %err, "Batch read failed; reporting in-flight records only");
                None
            }
        };

        let mut views = Vec::new();
        let mut seen = HashSet::new();
        if let Some(stored) = stored {
            for record in &stored.value {
                seen.insert(record.id);
                match tracked.remove(&record.id) {
                    Some(entry) if entry.supersedes(record) => views.push(entry.view(record.id)),
                    _ => views.push(RecordStatusView::from_record(record, stored.source.clone())),
                }
            }
        }
        for (id, entry) in tracked {
            if seen.insert(id) {
                views.push(entry.view(id));
            }
        }
        for id in replayed {
            if !seen.insert(id) {
                continue;
            }
            match self.reader.record(&id).await {
                Ok(Sourced {
                    value: Some(record),
                    source,
                }) => views.push(RecordStatusView::from_record(&record, source)),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(record_id = %id, error = %err, "Replayed record read failed");
                }
            }
        }

        if views.is_empty() {
            return Err(Error::NotFound(format!("batch {batch_id}")));
        }
        if views.iter().any(|view| view.source == ReadSource::InFlight) {
            self.metrics.record_read(&ReadSource::InFlight);
        }
        Ok(BatchStatusView::from_records(*batch_id, views))
    }

    /// Stamp the primary's heartbeat row; replicas measure lag against it.
    pub async fn heartbeat(&self) -> Result<()> {
        let timeout = self.config.writer.query_timeout;
        let stamp = async {
            let mut conn = self.pools.acquire_primary().await?;
            conn.write_heartbeat().await
        };
        tokio::time::timeout(timeout, stamp)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(timeout)))
    }

    /// Write a heartbeat every `heartbeat_interval` until [`shutdown`](Self::shutdown).
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while !*stop.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = engine.heartbeat().await {
                            tracing::warn!(error = %err, "Heartbeat failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat stopped");
        })
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn metrics(&self) -> &Arc<MetricsReporter> {
        &self.metrics
    }

    pub fn pool_status(&self) -> Vec<PoolStatus> {
        self.pools.status()
    }

    pub fn active_replicas(&self) -> Vec<String> {
        self.pools.active_replicas()
    }

    pub fn health(&self) -> EngineHealth {
        let breaker = self.breaker.snapshot();
        let replicas = self.pools.active_replicas();
        let configured_replicas = self.config.replicas.len();
        let degraded = breaker.state != BreakerState::Closed
            || replicas.len() < configured_replicas
            || self.closing.load(Ordering::SeqCst);
        EngineHealth {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ok
            },
            primary: self.pools.primary_host().to_string(),
            replicas,
            configured_replicas,
            breaker,
            pools: self.pools.status(),
            in_flight: self.dispatcher.tracker.len(),
        }
    }

    /// Refuse new submissions, wait up to `grace` for running writes, then
    /// close the pools.
    pub async fn shutdown(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(true);
        tracing::info!(in_flight = self.dispatcher.tracker.len(), "Sync engine shutting down");

        let all = u32::try_from(self.config.max_concurrent_writes).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.dispatcher.permits.acquire_many(all)).await {
            Ok(Ok(_drained)) => tracing::debug!("In-flight writes drained"),
            Ok(Err(_)) => {}
            Err(_) => tracing::warn!(
                in_flight = self.dispatcher.tracker.len(),
                ?grace,
                "Shutdown grace period elapsed with writes still running"
            ),
        }
        self.dispatcher.permits.close();
        self.pools.close();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::connection(
                self.pools.primary_host(),
                "engine is shut down",
            ));
        }
        Ok(())
    }

    fn in_flight_view(&self, entry: &Tracked, id: RecordId) -> RecordStatusView {
        self.metrics.record_read(&ReadSource::InFlight);
        entry.view(id)
    }
}
