//! Cluster facade
//!
//! Entry point of the crate. A `Cluster` opens endpoints through a `Connector`,
//! registers them with its `ConnectionRegistry` and routes reads, writes and
//! transactions according to the registry's policy:
//!
//! - reads go to a random healthy replica, or to the primary when none is healthy
//! - writes and transactions only ever go to the primary

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time;
use tracing::{debug, info, warn};

use crate::backends::{first_scalar, Connector, DatabaseRow, DatabaseValue, PostgresConnector};
use crate::config::{ClusterConfig, ConnectionOptions};
use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::error::{ClusterError, ClusterResult};
use crate::transaction::Transaction;

/// Primary/replica database cluster
pub struct Cluster {
    registry: RwLock<Arc<ConnectionRegistry>>,
    connector: Arc<dyn Connector>,
    config: ClusterConfig,
}

impl Cluster {
    /// Create a cluster backed by PostgreSQL
    ///
    /// Must be called from within a Tokio runtime: the healthy-replica refresh loop
    /// is spawned immediately.
    pub fn new(config: ClusterConfig) -> ClusterResult<Self> {
        Self::with_connector(config, Arc::new(PostgresConnector::new()))
    }

    /// Create a cluster that opens endpoints through `connector`
    pub fn with_connector(config: ClusterConfig, connector: Arc<dyn Connector>) -> ClusterResult<Self> {
        config.validate()?;
        let registry = ConnectionRegistry::start(config.conn_check_delay);

        Ok(Self {
            registry: RwLock::new(registry),
            connector,
            config,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The registry currently in use
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry.read())
    }

    /// Swap in another registry and hand back the previous one
    ///
    /// The previous registry keeps running until the caller shuts it down.
    pub fn replace_registry(&self, registry: Arc<ConnectionRegistry>) -> Arc<ConnectionRegistry> {
        std::mem::replace(&mut *self.registry.write(), registry)
    }

    /// Open `options` and make it the primary, releasing any previous primary
    pub async fn set_primary(&self, options: &ConnectionOptions) -> ClusterResult<()> {
        let registry = self.open_registry()?;
        let handle = self.open(options).await?;
        registry.set_primary(handle).await
    }

    /// Open `options` and register it as a replica
    pub async fn add_replica(&self, options: &ConnectionOptions) -> ClusterResult<()> {
        let registry = self.open_registry()?;
        let handle = self.open(options).await?;
        registry.add_replica(handle).await
    }

    /// Run a read query on a healthy replica, or on the primary if none is healthy
    pub async fn query(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        let handle = self
            .registry()
            .select_reader()
            .ok_or(ClusterError::NoReplicaAvailable)?;

        debug!(endpoint = %handle.endpoint(), "Routing read");
        handle.executor().query(sql, params).await
    }

    /// Read query decoding the first column of the first row
    pub async fn query_scalar<T: DeserializeOwned>(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<T> {
        let rows = self.query(sql, params).await?;
        first_scalar(&rows)
    }

    /// Run a statement on the primary
    pub async fn writer_exec(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<u64> {
        let handle = self.writer()?;
        debug!(endpoint = %handle.endpoint(), "Routing write");
        handle.executor().execute(sql, params).await
    }

    /// Run a query on the primary
    pub async fn writer_query(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        let handle = self.writer()?;
        debug!(endpoint = %handle.endpoint(), "Routing read to primary");
        handle.executor().query(sql, params).await
    }

    /// Primary query decoding the first column of the first row
    pub async fn writer_query_scalar<T: DeserializeOwned>(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<T> {
        let rows = self.writer_query(sql, params).await?;
        first_scalar(&rows)
    }

    /// Begin a transaction; transactions always run on the primary
    pub async fn new_transaction(&self) -> ClusterResult<Transaction> {
        let handle = self.writer()?;
        let inner = handle.executor().begin_transaction().await?;
        Ok(Transaction::new(inner, handle.endpoint()))
    }

    /// Point-in-time view of the cluster's connections
    pub fn status(&self) -> ClusterStatus {
        let registry = self.registry();
        let healthy_replicas = registry.healthy_replicas().len();

        ClusterStatus {
            primary: registry.primary().as_deref().map(EndpointStatus::from),
            replicas: registry
                .replicas()
                .iter()
                .map(|handle| EndpointStatus::from(handle.as_ref()))
                .collect(),
            healthy_replicas,
            closed: registry.is_closed(),
        }
    }

    /// Close every connection. Idempotent.
    pub async fn shutdown(&self) {
        info!("Shutting down cluster");
        self.registry().shutdown().await;
    }

    fn writer(&self) -> ClusterResult<Arc<ConnectionHandle>> {
        self.registry()
            .select_writer()
            .ok_or(ClusterError::NoPrimaryAvailable)
    }

    fn open_registry(&self) -> ClusterResult<Arc<ConnectionRegistry>> {
        let registry = self.registry();
        if registry.is_closed() {
            return Err(ClusterError::Closed);
        }
        Ok(registry)
    }

    /// Open a handle, retrying up to `max_conn_attempts` times
    async fn open(&self, options: &ConnectionOptions) -> ClusterResult<Arc<ConnectionHandle>> {
        let mut options = options.clone();
        options.prepend_caller |= self.config.prepend_caller;

        let max_attempts = self.config.max_conn_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.try_open(&options).await {
                Ok(handle) => return Ok(handle),
                Err(err) if attempt < max_attempts => {
                    warn!(
                        endpoint = %options.address(),
                        attempt,
                        max_attempts,
                        error = %err,
                        "Connection attempt failed, retrying"
                    );
                    time::sleep(self.config.conn_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_open(&self, options: &ConnectionOptions) -> ClusterResult<Arc<ConnectionHandle>> {
        let executor = self.connector.connect(options).await?;
        ConnectionHandle::connect(
            options.address(),
            executor,
            self.config.ping_timeout,
            self.config.conn_check_delay,
        )
        .await
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("registry", &self.registry())
            .field("config", &self.config)
            .finish()
    }
}

/// Connectivity of a single endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub connected: bool,
}

impl From<&ConnectionHandle> for EndpointStatus {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            endpoint: handle.endpoint().to_string(),
            connected: handle.is_connected(),
        }
    }
}

/// Snapshot returned by `Cluster::status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub primary: Option<EndpointStatus>,
    pub replicas: Vec<EndpointStatus>,
    /// Replicas routable as of the last healthy-view recomputation
    pub healthy_replicas: usize,
    pub closed: bool,
}

impl ClusterStatus {
    /// Whether writes can currently be served
    pub fn can_write(&self) -> bool {
        !self.closed && self.primary.as_ref().is_some_and(|primary| primary.connected)
    }

    /// Whether reads can currently be served
    pub fn can_read(&self) -> bool {
        !self.closed && (self.healthy_replicas > 0 || self.can_write())
    }
}
