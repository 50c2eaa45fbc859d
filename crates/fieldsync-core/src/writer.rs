//! Transactional writer
//!
//! Every logical write runs inside the circuit breaker as a retry loop of
//! single-transaction attempts on the primary. Each attempt re-reads the
//! stored row and decides with [`decide`]:
//!
//! | stored row                        | incoming version | effect                    |
//! |-----------------------------------|------------------|---------------------------|
//! | none                              | any              | insert, `committed`       |
//! | committed / conflict              | greater          | update, `committed`       |
//! | committed                         | equal, same hash | no-op, `committed`        |
//! | conflict                          | equal, same hash | restore to `committed`    |
//! | committed / conflict              | equal, new hash  | mark `conflict`, error    |
//! | committed / conflict              | lower            | no-op, `committed`        |
//! | pending / processing / failed     | greater or equal | update, `committed`       |
//! | pending / processing / failed     | lower            | no-op, `committed`        |
//! | different owner or entity type    | any              | constraint error          |
//!
//! Updates are compare-and-swap on the stored version and status, so a
//! concurrent writer makes the attempt fail with a retryable contention error
//! and the next attempt decides again against fresh state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::Instrument;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::WriterConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsReporter;
use crate::models::{RecordId, SyncRecord, SyncStatus};
use crate::pool::{PoolManager, PooledConnection, Transaction};
use crate::shard::ShardRouter;
use crate::store::Expected;

/// Bound on marking a record failed while the breaker is not closed
pub const MARK_FAILED_OPEN_TIMEOUT: Duration = Duration::from_secs(1);

/// Effect of a successful write; the record is `committed` in every case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated { previous_version: i64 },
    /// Equal or older version already stored; nothing changed
    Replayed { stored_version: i64 },
}

impl WriteOutcome {
    pub const fn status(self) -> SyncStatus {
        SyncStatus::Committed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub id: RecordId,
    pub shard_id: u32,
    pub attempts: u32,
    pub outcome: WriteOutcome,
}

/// What an attempt should do given the stored row
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decision {
    Insert,
    Update { expected: Expected, previous_version: i64 },
    Replay { stored_version: i64 },
    Conflict { stored: Box<SyncRecord> },
    Reject(String),
}

pub(crate) fn decide(stored: Option<&SyncRecord>, incoming: &SyncRecord) -> Decision {
    let Some(stored) = stored else {
        return Decision::Insert;
    };

    if stored.user_id != incoming.user_id || stored.entity_type != incoming.entity_type {
        return Decision::Reject(format!(
            "record {} is stored for user {} as '{}'; refusing write for user {} as '{}'",
            stored.id, stored.user_id, stored.entity_type, incoming.user_id, incoming.entity_type
        ));
    }

    let update = Decision::Update {
        expected: Expected::of(stored),
        previous_version: stored.version,
    };
    let replay = Decision::Replay {
        stored_version: stored.version,
    };

    if !stored.status.has_committed_data() {
        return if incoming.version >= stored.version {
            update
        } else {
            replay
        };
    }

    match incoming.version.cmp(&stored.version) {
        std::cmp::Ordering::Greater => update,
        std::cmp::Ordering::Less => replay,
        std::cmp::Ordering::Equal => {
            if stored.payload_hash() != incoming.payload_hash() {
                Decision::Conflict {
                    stored: Box::new(stored.clone()),
                }
            } else if stored.status == SyncStatus::Conflict {
                update
            } else {
                replay
            }
        }
    }
}

enum Applied {
    Done(WriteOutcome),
    Conflict(Error),
}

/// Idempotent upsert of sync records with retry, backoff and conflict detection
pub struct TransactionalWriter {
    pools: Arc<PoolManager>,
    router: ShardRouter,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsReporter>,
    config: WriterConfig,
}

impl TransactionalWriter {
    pub fn new(
        pools: Arc<PoolManager>,
        router: ShardRouter,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsReporter>,
        config: WriterConfig,
    ) -> Self {
        Self {
            pools,
            router,
            breaker,
            metrics,
            config,
        }
    }

    /// Backoff before re-attempt number `retry` (0-based): `base * 2^retry`,
    /// so 2s, 4s, 8s with the default base
    pub fn backoff(&self, retry: u32) -> Duration {
        self.config.retry_base.saturating_mul(1_u32 << retry.min(16))
    }

    /// Reject records that must never reach the database.
    pub fn validate(&self, record: &SyncRecord) -> Result<()> {
        record.validate()?;
        let allowed = &self.config.allowed_entity_types;
        if !allowed.is_empty() && !allowed.contains(&record.entity_type) {
            return Err(Error::InvalidRecord(format!(
                "entity type '{}' is not accepted",
                record.entity_type
            )));
        }
        Ok(())
    }

    /// Persist `record` exactly once in effect.
    ///
    /// Returns `Conflict` for an equal version with a different payload and
    /// `CircuitOpen` when the breaker refuses the write. Any other failure
    /// is wrapped in `WriteFailed` after the record has been marked failed.
    pub async fn write(&self, mut record: SyncRecord) -> Result<WriteReceipt> {
        if let Err(err) = self.validate(&record) {
            self.metrics.record_rejected();
            tracing::info!(record_id = %record.id, error = %err, "Rejected invalid record");
            return Err(err);
        }

        record.shard_id = self.router.route(&record.user_id);
        let span = tracing::info_span!(
            "sync_write",
            record_id = %record.id,
            shard = record.shard_id,
            version = record.version
        );
        self.write_routed(record).instrument(span).await
    }

    /// [`write`](Self::write) bounded by a caller deadline covering every
    /// attempt and backoff. On expiry the open transaction is abandoned and
    /// the record is left as it was.
    pub async fn write_with_deadline(
        &self,
        record: SyncRecord,
        deadline: Duration,
    ) -> Result<WriteReceipt> {
        let id = record.id;
        tokio::time::timeout(deadline, self.write(record))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(record_id = %id, ?deadline, "Write deadline exceeded");
                Err(Error::DeadlineExceeded(deadline))
            })
    }

    async fn write_routed(&self, record: SyncRecord) -> Result<WriteReceipt> {
        let shard_id = record.shard_id;
        let started = Instant::now();
        self.metrics.record_attempt(shard_id);

        let mut attempts = 0;
        let result = self
            .breaker
            .call(self.retry_loop(&record, &mut attempts))
            .await;
        let latency = started.elapsed();

        match result {
            Ok(outcome) => {
                match outcome {
                    WriteOutcome::Replayed { .. } => {
                        self.metrics.record_stale_replay(shard_id, latency);
                    }
                    _ => self.metrics.record_success(shard_id, latency),
                }
                tracing::debug!(attempts, ?outcome, "Record committed");
                Ok(WriteReceipt {
                    id: record.id,
                    shard_id,
                    attempts,
                    outcome,
                })
            }
            Err(err @ Error::Conflict { .. }) => {
                self.metrics.record_conflict(shard_id, latency);
                tracing::info!(error = %err, "Version conflict");
                Err(err)
            }
            Err(err @ Error::CircuitOpen { .. }) => {
                tracing::debug!(error = %err, "Write refused by circuit breaker");
                Err(err)
            }
            Err(err) => {
                self.metrics.record_failure(shard_id, latency);
                tracing::warn!(attempts, error = %err, "Write failed");
                self.mark_failed(&record, &err, attempts).await;
                Err(Error::WriteFailed {
                    id: record.id,
                    shard_id,
                    attempts,
                    source: Box::new(err),
                })
            }
        }
    }

    async fn retry_loop(&self, record: &SyncRecord, attempts: &mut u32) -> Result<WriteOutcome> {
        let mut retry = 0;
        loop {
            *attempts = retry + 1;
            let result = tokio::time::timeout(self.config.query_timeout, self.attempt(record, retry))
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(self.config.query_timeout)));

            match result {
                Err(err) if err.is_retryable() && retry < self.config.max_retries => {
                    let delay = self.backoff(retry);
                    self.metrics.record_retry(record.shard_id);
                    tracing::debug!(attempt = retry + 1, ?delay, error = %err, "Retrying write");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }

    async fn attempt(&self, record: &SyncRecord, retry: u32) -> Result<WriteOutcome> {
        let mut conn = self.pools.acquire_primary().await?;
        let result = Self::apply(&mut conn, record, retry).await;
        if let Err(Error::Connection { .. }) = &result {
            conn.discard();
        }
        match result? {
            Applied::Done(outcome) => Ok(outcome),
            Applied::Conflict(err) => Err(err),
        }
    }

    async fn apply(conn: &mut PooledConnection, record: &SyncRecord, retry: u32) -> Result<Applied> {
        let mut tx = conn.begin().await?;
        match Self::upsert(&mut tx, record, retry).await {
            Ok(applied) => {
                tx.commit().await?;
                Ok(applied)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::debug!(error = %rollback_err, "Rollback failed; connection discarded");
                }
                Err(err)
            }
        }
    }

    async fn upsert(tx: &mut Transaction<'_>, record: &SyncRecord, retry: u32) -> Result<Applied> {
        let stored = tx.load_record(&record.id).await?;
        let now = Utc::now();

        match decide(stored.as_ref(), record) {
            Decision::Insert => {
                let mut row = record.clone();
                row.status = SyncStatus::Committed;
                row.error_message = None;
                row.retry_count = retry;
                row.created_at = now;
                row.updated_at = now;
                tx.insert_record(&row).await?;
                Ok(Applied::Done(WriteOutcome::Inserted))
            }
            Decision::Update {
                expected,
                previous_version,
            } => {
                let mut row = record.clone();
                row.status = SyncStatus::Committed;
                row.error_message = None;
                row.retry_count = retry;
                row.updated_at = now;
                if let Some(stored) = &stored {
                    row.created_at = stored.created_at;
                }
                if tx.update_record(&row, expected).await? == 0 {
                    return Err(Error::Contention(format!(
                        "record {} changed since it was read",
                        record.id
                    )));
                }
                Ok(Applied::Done(WriteOutcome::Updated { previous_version }))
            }
            Decision::Replay { stored_version } => {
                Ok(Applied::Done(WriteOutcome::Replayed { stored_version }))
            }
            Decision::Conflict { stored } => {
                let conflict = Error::Conflict {
                    id: record.id,
                    stored_version: stored.version,
                    incoming_version: record.version,
                };
                let mut row = (*stored).clone();
                row.status = SyncStatus::Conflict;
                row.error_message = Some(conflict.to_string());
                row.updated_at = now;
                if tx.update_record(&row, Expected::of(&stored)).await? == 0 {
                    return Err(Error::Contention(format!(
                        "record {} changed since it was read",
                        record.id
                    )));
                }
                Ok(Applied::Conflict(conflict))
            }
            Decision::Reject(reason) => Err(Error::Constraint(reason)),
        }
    }

    /// Best effort: persist `failed` unless the row already holds committed
    /// data, belongs to someone else, or has a newer version.
    ///
    /// Attempted once even when this failure tripped the breaker, but then
    /// bounded by [`MARK_FAILED_OPEN_TIMEOUT`].
    async fn mark_failed(&self, record: &SyncRecord, reason: &Error, attempts: u32) {
        let timeout = if self.breaker.state() == BreakerState::Closed {
            self.config.query_timeout
        } else {
            self.config.query_timeout.min(MARK_FAILED_OPEN_TIMEOUT)
        };
        let marked =
            tokio::time::timeout(timeout, self.try_mark_failed(record, reason, attempts)).await;
        match marked {
            Ok(Ok(true)) => tracing::debug!("Record marked failed"),
            Ok(Ok(false)) => tracing::debug!("Stored row kept; not marked failed"),
            Ok(Err(err)) => tracing::warn!(error = %err, "Could not mark record failed"),
            Err(_) => tracing::warn!("Timed out marking record failed"),
        }
    }

    async fn try_mark_failed(&self, record: &SyncRecord, reason: &Error, attempts: u32) -> Result<bool> {
        let mut conn = self.pools.acquire_primary().await?;
        let mut tx = conn.begin().await?;
        let stored = tx.load_record(&record.id).await?;

        let now = Utc::now();
        let mut row = record.clone();
        row.status = SyncStatus::Failed;
        row.error_message = Some(reason.root().to_string());
        row.retry_count = attempts.saturating_sub(1).min(self.config.max_retries);
        row.created_at = now;
        row.updated_at = now;

        let changed = match &stored {
            None => {
                tx.insert_record(&row).await?;
                true
            }
            Some(stored)
                if stored.status.has_committed_data()
                    || stored.user_id != record.user_id
                    || stored.entity_type != record.entity_type
                    || stored.version > record.version =>
            {
                false
            }
            Some(stored) => {
                row.created_at = stored.created_at;
                tx.update_record(&row, Expected::of(stored)).await? > 0
            }
        };
        tx.commit().await?;
        Ok(changed)
    }
}
