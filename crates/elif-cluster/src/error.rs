//! Error types for the cluster access layer
//!
//! Routing errors (`NoPrimaryAvailable`, `NoReplicaAvailable`) are kept apart from
//! execution errors: a routing error means no statement was sent anywhere.

use std::time::Duration;

use crate::config::ConfigError;

/// Result type alias for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Error types for cluster operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A liveness probe did not complete within its timeout
    #[error("ping timeout after {timeout:?}")]
    ProbeTimeout { timeout: Duration },

    /// Failure reported by the execution backend, passed through as-is
    #[error("{0}")]
    Database(String),

    /// The endpoint could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Neither a healthy replica nor the primary could serve a read
    #[error("no slave connection available")]
    NoReplicaAvailable,

    /// The primary is unset or currently unreachable
    #[error("no master connection available")]
    NoPrimaryAvailable,

    /// Commit or rollback was already issued for this transaction
    #[error("transaction has already been committed or rolled back")]
    TransactionAlreadyFinished,

    /// The cluster was shut down
    #[error("cluster has been shut down")]
    Closed,

    /// A result value could not be converted into the requested type
    #[error("Decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl ClusterError {
    /// Whether this error came from routing rather than from a backend call
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            ClusterError::NoReplicaAvailable | ClusterError::NoPrimaryAvailable
        )
    }
}

impl From<sqlx::Error> for ClusterError {
    fn from(err: sqlx::Error) -> Self {
        ClusterError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Decode(err.to_string())
    }
}
