//! Connection pools for the primary and its replicas
//!
//! Connections are handed out as [`PooledConnection`] handles that go back to
//! the idle set when dropped, on every exit path. A handle dropped in the
//! middle of a transaction, or flagged as broken, is discarded instead; the
//! backend then rolls the open transaction back.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{EngineConfig, HostSpec, PoolConfig};
use crate::error::{Error, Result};
use crate::shard::fnv1a_32;
use crate::store::{StoreConnection, StoreConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    Primary,
    Replica,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub host: String,
    pub role: PoolRole,
    pub idle: usize,
    pub in_use: usize,
    pub max_connections: usize,
}

/// Bounded set of connections to one host
pub struct ConnectionPool {
    host: HostSpec,
    role: PoolRole,
    connector: Arc<dyn StoreConnector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn StoreConnection>>>,
    max_connections: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        host: HostSpec,
        role: PoolRole,
        connector: Arc<dyn StoreConnector>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            host,
            role,
            connector,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            idle: Mutex::new(Vec::new()),
            max_connections: config.max_connections,
            acquire_timeout: config.acquire_timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host.name
    }

    pub const fn role(&self) -> PoolRole {
        self.role
    }

    /// Wait for a free slot, reuse an idle connection or open a new one.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| Error::Timeout(self.acquire_timeout))?
        .map_err(|_| Error::connection(&self.host.name, "pool is closed"))?;

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.connector.connect(&self.host).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
            broken: false,
        })
    }

    /// Open a connection and ping it.
    async fn verify(self: &Arc<Self>) -> Result<()> {
        let mut conn = self.acquire().await?;
        if let Err(err) = conn.ping().await {
            conn.discard();
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            host: self.host.name.clone(),
            role: self.role,
            idle: self.idle.lock().len(),
            in_use: self
                .max_connections
                .saturating_sub(self.permits.available_permits()),
            max_connections: self.max_connections,
        }
    }

    fn release(&self, conn: Box<dyn StoreConnection>) {
        if self.is_closed() {
            return;
        }
        self.idle.lock().push(conn);
    }
}

/// Scoped connection; returned to its pool on drop
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
}

impl PooledConnection {
    pub fn host(&self) -> &str {
        self.pool.host()
    }

    /// Close the connection instead of reusing it.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// Start a transaction. The returned guard must be committed or rolled
    /// back; dropping it discards the connection.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        if let Err(err) = self.deref_mut().begin().await {
            self.broken = true;
            return Err(err);
        }
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn.as_ref(),
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn.as_mut(),
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            tracing::debug!(host = self.pool.host(), "Discarding connection");
            return;
        }
        self.pool.release(conn);
    }
}

/// Open transaction on a pooled connection
pub struct Transaction<'a> {
    conn: &'a mut PooledConnection,
    finished: bool,
}

impl Transaction<'_> {
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        let result = self.conn.deref_mut().commit().await;
        if result.is_err() {
            self.conn.broken = true;
        }
        result
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let result = self.conn.deref_mut().rollback().await;
        if result.is_err() {
            self.conn.broken = true;
        }
        result
    }
}

impl Deref for Transaction<'_> {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        &**self.conn
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.conn
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.broken = true;
        }
    }
}

/// Registry of the primary pool and every reachable replica pool
pub struct PoolManager {
    primary: Arc<ConnectionPool>,
    replicas: BTreeMap<String, Arc<ConnectionPool>>,
    replica_order: Vec<String>,
    next_replica: AtomicUsize,
}

impl PoolManager {
    /// Open and verify every pool.
    ///
    /// Fails if the primary cannot be reached. Unreachable replicas are
    /// logged and left out.
    pub async fn connect(config: &EngineConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        let primary = Arc::new(ConnectionPool::new(
            config.primary.clone(),
            PoolRole::Primary,
            Arc::clone(&connector),
            &config.pool,
        ));
        if let Err(err) = primary.verify().await {
            tracing::error!(host = primary.host(), error = %err, "Primary database unreachable");
            return Err(match err {
                Error::Connection { .. } => err,
                other => Error::connection(primary.host(), other),
            });
        }
        tracing::info!(host = primary.host(), "Primary pool ready");

        let mut replicas = BTreeMap::new();
        let mut replica_order = Vec::new();
        for spec in &config.replicas {
            let pool = Arc::new(ConnectionPool::new(
                spec.clone(),
                PoolRole::Replica,
                Arc::clone(&connector),
                &config.pool,
            ));
            match pool.verify().await {
                Ok(()) => {
                    tracing::info!(host = pool.host(), "Replica pool ready");
                    replica_order.push(spec.name.clone());
                    replicas.insert(spec.name.clone(), pool);
                }
                Err(err) => {
                    tracing::warn!(
                        host = %spec.name,
                        error = %err,
                        "Replica unreachable; continuing without it"
                    );
                }
            }
        }

        Ok(Self {
            primary,
            replicas,
            replica_order,
            next_replica: AtomicUsize::new(0),
        })
    }

    pub async fn acquire_primary(&self) -> Result<PooledConnection> {
        self.primary.acquire().await
    }

    /// Pick a replica pool: sticky by `hint` when given, round robin otherwise.
    pub fn select_replica(&self, hint: Option<&str>) -> Option<&Arc<ConnectionPool>> {
        if self.replica_order.is_empty() {
            return None;
        }
        let index = match hint {
            Some(hint) => fnv1a_32(hint.as_bytes()) as usize,
            None => self.next_replica.fetch_add(1, Ordering::Relaxed),
        } % self.replica_order.len();
        self.replicas.get(&self.replica_order[index])
    }

    /// Connection to a replica, or `None` when no replica is active
    pub async fn acquire_replica(&self, hint: Option<&str>) -> Option<Result<PooledConnection>> {
        let pool = self.select_replica(hint)?;
        Some(pool.acquire().await)
    }

    pub fn primary_host(&self) -> &str {
        self.primary.host()
    }

    pub fn active_replicas(&self) -> Vec<String> {
        self.replica_order.clone()
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        std::iter::once(&self.primary)
            .chain(self.replicas.values())
            .map(|pool| pool.status())
            .collect()
    }

    /// Close every pool. Idle connections are dropped now, checked-out
    /// ones when their handles are; later acquisitions fail.
    pub fn close(&self) {
        self.primary.close();
        for pool in self.replicas.values() {
            pool.close();
        }
        tracing::info!(replicas = self.replicas.len(), "Connection pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryConnector, MemoryHost};

    fn config(connector: &MemoryConnector, replicas: &[&str]) -> (EngineConfig, MemoryHost) {
        let primary = MemoryHost::new();
        let spec = connector.add_host("primary", primary.clone());
        let replica_specs = replicas
            .iter()
            .map(|name| connector.add_host(name, primary.mirror()))
            .collect();
        let mut config = EngineConfig::new(spec).with_replicas(replica_specs);
        config.pool.max_connections = 2;
        config.pool.acquire_timeout = Duration::from_millis(50);
        (config, primary)
    }

    #[tokio::test]
    async fn unreachable_primary_fails_fast() {
        let connector = MemoryConnector::new();
        let (config, primary) = config(&connector, &[]);
        primary.set_unreachable(true);
        let result = PoolManager::connect(&config, Arc::new(connector)).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn failed_ping_on_primary_is_a_connection_error() {
        let connector = MemoryConnector::new();
        let (config, primary) = config(&connector, &[]);
        primary.fail_next([Fault::Transient]);
        let result = PoolManager::connect(&config, Arc::new(connector)).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn unreachable_replica_is_excluded() {
        let connector = MemoryConnector::new();
        let (config, _) = config(&connector, &["replica-a", "replica-b"]);
        connector.host("replica-b").unwrap().set_unreachable(true);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        assert_eq!(pools.active_replicas(), vec!["replica-a".to_string()]);
    }

    #[tokio::test]
    async fn connections_are_reused_after_drop() {
        let connector = MemoryConnector::new();
        let (config, primary) = config(&connector, &[]);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        let before = primary.connects();
        for _ in 0..5 {
            let mut conn = pools.acquire_primary().await.unwrap();
            conn.ping().await.unwrap();
        }
        assert_eq!(primary.connects(), before);
    }

    #[tokio::test]
    async fn abandoned_transaction_discards_connection() {
        let connector = MemoryConnector::new();
        let (config, primary) = config(&connector, &[]);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        {
            let mut conn = pools.acquire_primary().await.unwrap();
            let _tx = conn.begin().await.unwrap();
        }
        assert_eq!(pools.status()[0].idle, 0);

        let mut conn = pools.acquire_primary().await.unwrap();
        let tx = conn.begin().await.unwrap();
        tx.commit().await.unwrap();
        drop(conn);
        assert_eq!(pools.status()[0].idle, 1);
        assert!(primary.connects() >= 2);
    }

    #[tokio::test]
    async fn acquisition_times_out_when_exhausted() {
        let connector = MemoryConnector::new();
        let (config, _) = config(&connector, &[]);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        let _a = pools.acquire_primary().await.unwrap();
        let _b = pools.acquire_primary().await.unwrap();
        assert_eq!(pools.status()[0].in_use, 2);
        let Err(err) = pools.acquire_primary().await else {
            panic!("exhausted pool handed out a connection");
        };
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn hinted_replica_selection_is_sticky() {
        let connector = MemoryConnector::new();
        let (config, _) = config(&connector, &["replica-a", "replica-b", "replica-c"]);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        let first = pools.select_replica(Some("user-42")).unwrap().host().to_string();
        for _ in 0..10 {
            assert_eq!(pools.select_replica(Some("user-42")).unwrap().host(), first);
        }
        let round_robin: Vec<_> = (0..3)
            .map(|_| pools.select_replica(None).unwrap().host().to_string())
            .collect();
        assert_eq!(round_robin, vec!["replica-a", "replica-b", "replica-c"]);
    }

    #[tokio::test]
    async fn close_rejects_new_acquisitions() {
        let connector = MemoryConnector::new();
        let (config, _) = config(&connector, &["replica-a"]);
        let pools = PoolManager::connect(&config, Arc::new(connector))
            .await
            .unwrap();
        pools.close();
        assert!(matches!(
            pools.acquire_primary().await,
            Err(Error::Connection { .. })
        ));
        assert!(matches!(
            pools.acquire_replica(None).await,
            Some(Err(Error::Connection { .. }))
        ));
    }
}
