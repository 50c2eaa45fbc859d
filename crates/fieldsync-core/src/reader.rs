//! Replica-aware reads
//!
//! Status queries go to a replica when one is active and its replication lag
//! is within bounds. A lagging replica, one whose lag is unknown, or one that
//! fails the query is skipped in favor of the primary. Callers only see where
//! the answer came from, never why.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::metrics::MetricsReporter;
use crate::models::{BatchId, ReadSource, RecordId, SyncRecord};
use crate::pool::{PoolManager, PooledConnection};
use crate::store::StoreConnection;

type QueryFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// A read result tagged with the host that served it
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ReadSource,
}

pub struct ReplicaReader {
    pools: Arc<PoolManager>,
    metrics: Arc<MetricsReporter>,
    max_lag: Duration,
    query_timeout: Duration,
}

impl ReplicaReader {
    pub fn new(
        pools: Arc<PoolManager>,
        metrics: Arc<MetricsReporter>,
        max_lag: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            pools,
            metrics,
            max_lag,
            query_timeout,
        }
    }

    pub async fn record(&self, id: &RecordId) -> Result<Sourced<Option<SyncRecord>>> {
        let id = *id;
        self.read(&id.as_str(), move |conn| {
            Box::pin(async move { conn.load_record(&id).await })
        })
        .await
    }

    pub async fn batch(&self, batch_id: &BatchId) -> Result<Sourced<Vec<SyncRecord>>> {
        let batch_id = *batch_id;
        self.read(&batch_id.as_str(), move |conn| {
            Box::pin(async move { conn.load_batch(&batch_id).await })
        })
        .await
    }

    async fn read<T, F>(&self, hint: &str, query: F) -> Result<Sourced<T>>
    where
        F: for<'c> Fn(&'c mut dyn StoreConnection) -> QueryFuture<'c, T>,
    {
        if let Some(mut conn) = self.fresh_replica(hint).await {
            match self.bounded(query(&mut *conn)).await {
                Ok(value) => {
                    let source = ReadSource::Replica(conn.host().to_string());
                    self.metrics.record_read(&source);
                    return Ok(Sourced { value, source });
                }
                Err(err) => {
                    tracing::warn!(host = conn.host(), error = %err, "Replica read failed; using primary");
                    discard_if_broken(&mut conn, &err);
                    self.metrics.record_read_fallback();
                }
            }
        }

        let result = async {
            let mut conn = self.pools.acquire_primary().await?;
            let result = self.bounded(query(&mut *conn)).await;
            if let Err(err) = &result {
                discard_if_broken(&mut conn, err);
            }
            result
        }
        .await;

        match result {
            Ok(value) => {
                self.metrics.record_read(&ReadSource::Primary);
                Ok(Sourced {
                    value,
                    source: ReadSource::Primary,
                })
            }
            Err(err) => {
                self.metrics.record_read_error();
                Err(err)
            }
        }
    }

    /// A replica connection whose lag is known and within bounds
    async fn fresh_replica(&self, hint: &str) -> Option<PooledConnection> {
        let mut conn = match self.pools.acquire_replica(Some(hint)).await? {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "Replica unavailable; using primary");
                self.metrics.record_read_fallback();
                return None;
            }
        };

        match self.bounded(conn.replication_lag()).await {
            Ok(Some(lag)) if lag <= self.max_lag => Some(conn),
            Ok(lag) => {
                tracing::debug!(host = conn.host(), ?lag, "Replica behind; using primary");
                self.metrics.record_read_fallback();
                None
            }
            Err(err) => {
                tracing::warn!(host = conn.host(), error = %err, "Replica lag check failed");
                discard_if_broken(&mut conn, &err);
                self.metrics.record_read_fallback();
                None
            }
        }
    }

    async fn bounded<T>(&self, query: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.query_timeout, query)
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(self.query_timeout)))
    }
}

fn discard_if_broken(conn: &mut PooledConnection, err: &Error) {
    if matches!(err, Error::Connection { .. } | Error::Timeout(_)) {
        conn.discard();
    }
}
