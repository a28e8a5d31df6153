//! # elif-cluster: Primary/Replica Routing for elif.rs
//!
//! Client-side access layer for a database cluster made of one writable primary
//! and any number of read-only replicas. Every connection is probed in the
//! background; reads are spread over the replicas that are currently healthy and
//! fall back to the primary, while writes and transactions always go to the primary.
//!
//! ```no_run
//! use elif_cluster::{Cluster, ClusterConfig, ConnectionOptions, DatabaseValue};
//!
//! # async fn run() -> elif_cluster::ClusterResult<()> {
//! let cluster = Cluster::new(ClusterConfig::from_env()?)?;
//! cluster.set_primary(&ConnectionOptions::from_url("postgres://app@db-primary/app")?).await?;
//! cluster.add_replica(&ConnectionOptions::from_url("postgres://app@db-replica-1/app")?).await?;
//!
//! let total: i64 = cluster.query_scalar("SELECT count(*) FROM users", &[]).await?;
//! cluster.writer_exec("UPDATE stats SET users = $1", &[DatabaseValue::from(total)]).await?;
//!
//! cluster.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;

pub use backends::{
    Connector, DatabaseRow, DatabaseRowExt, DatabaseTransaction, DatabaseValue, PostgresConnector,
    SqlExecutor,
};
pub use cluster::{Cluster, ClusterStatus, EndpointStatus};
pub use config::{ClusterConfig, ConfigError, ConnectionOptions};
pub use connection::{ConnectionHandle, ConnectionRegistry, ProbeOutcome};
pub use error::{ClusterError, ClusterResult};
pub use transaction::Transaction;
