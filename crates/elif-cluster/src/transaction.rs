//! Transaction Management
//!
//! Transactions always run on the primary. Commit and rollback are single-use:
//! once either has been issued, every further call fails with
//! `TransactionAlreadyFinished` without reaching the backend.

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backends::{first_scalar, DatabaseRow, DatabaseTransaction, DatabaseValue};
use crate::error::{ClusterError, ClusterResult};

/// Transaction bound to the primary
pub struct Transaction {
    inner: Option<Box<dyn DatabaseTransaction>>,
    endpoint: String,
    committed: bool,
}

impl Transaction {
    pub(crate) fn new(inner: Box<dyn DatabaseTransaction>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        debug!(endpoint = %endpoint, "Transaction started");
        Self {
            inner: Some(inner),
            endpoint,
            committed: false,
        }
    }

    fn active(&mut self) -> ClusterResult<&mut Box<dyn DatabaseTransaction>> {
        self.inner.as_mut().ok_or(ClusterError::TransactionAlreadyFinished)
    }

    /// Run a query inside the transaction
    pub async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        self.active()?.query(sql, params).await
    }

    /// Run a query and decode the first column of its first row
    pub async fn query_scalar<T: DeserializeOwned>(&mut self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<T> {
        let rows = self.query(sql, params).await?;
        first_scalar(&rows)
    }

    /// Run a statement inside the transaction
    pub async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<u64> {
        self.active()?.execute(sql, params).await
    }

    /// Commit the transaction
    pub async fn commit(&mut self) -> ClusterResult<()> {
        let tx = self.inner.take().ok_or(ClusterError::TransactionAlreadyFinished)?;
        debug!(endpoint = %self.endpoint, "Committing transaction");
        tx.commit().await?;
        self.committed = true;
        Ok(())
    }

    /// Roll the transaction back
    pub async fn rollback(&mut self) -> ClusterResult<()> {
        let tx = self.inner.take().ok_or(ClusterError::TransactionAlreadyFinished)?;
        debug!(endpoint = %self.endpoint, "Rolling back transaction");
        tx.rollback().await
    }

    /// Whether commit or rollback is still pending
    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Endpoint of the primary the transaction runs on
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.is_some() {
            warn!(endpoint = %self.endpoint, "Transaction dropped without commit or rollback");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("endpoint", &self.endpoint)
            .field("active", &self.is_active())
            .field("committed", &self.committed)
            .finish()
    }
}
