//! Deterministic test doubles
//!
//! `MockExecutor` answers queries from a table of canned scalar results and lets a
//! test flip its liveness at runtime. Clones share state, so a test can keep one
//! clone for inspection while the cluster owns another.
//!
//! Only compiled with the `testing` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::backends::{Connector, DatabaseRow, DatabaseTransaction, DatabaseValue, SqlExecutor};
use crate::config::{ConfigError, ConnectionOptions};
use crate::error::{ClusterError, ClusterResult};

/// How a mock answers liveness probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingMode {
    Healthy,
    Failing(String),
    /// Never completes; only a probe timeout ends it
    Hanging,
}

/// Final outcome of a mock transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct MockState {
    name: String,
    results: RwLock<HashMap<String, DatabaseValue>>,
    ping_mode: Mutex<PingMode>,
    ping_failures_left: AtomicUsize,
    statement_error: Mutex<Option<String>>,
    statements: Mutex<Vec<String>>,
    outcomes: Mutex<Vec<TransactionOutcome>>,
    ping_calls: AtomicUsize,
    query_calls: AtomicUsize,
    execute_calls: AtomicUsize,
    begin_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

/// In-memory `SqlExecutor`
#[derive(Debug, Clone)]
pub struct MockExecutor {
    state: Arc<MockState>,
}

impl MockExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(MockState {
                name: name.into(),
                results: RwLock::new(HashMap::new()),
                ping_mode: Mutex::new(PingMode::Healthy),
                ping_failures_left: AtomicUsize::new(0),
                statement_error: Mutex::new(None),
                statements: Mutex::new(Vec::new()),
                outcomes: Mutex::new(Vec::new()),
                ping_calls: AtomicUsize::new(0),
                query_calls: AtomicUsize::new(0),
                execute_calls: AtomicUsize::new(0),
                begin_calls: AtomicUsize::new(0),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer `sql` with a single row holding `value`
    pub fn with_result(self, sql: &str, value: impl Into<DatabaseValue>) -> Self {
        self.state.results.write().insert(normalize(sql), value.into());
        self
    }

    pub fn with_ping_mode(self, mode: PingMode) -> Self {
        self.set_ping_mode(mode);
        self
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn set_ping_mode(&self, mode: PingMode) {
        *self.state.ping_mode.lock() = mode;
    }

    /// Fail the next `count` probes, then fall back to the configured ping mode
    pub fn fail_next_pings(&self, count: usize) {
        self.state.ping_failures_left.store(count, Ordering::SeqCst);
    }

    /// Make every query and statement fail with `message`
    pub fn fail_statements(&self, message: impl Into<String>) {
        *self.state.statement_error.lock() = Some(message.into());
    }

    pub fn ping_calls(&self) -> usize {
        self.state.ping_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.state.query_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> usize {
        self.state.execute_calls.load(Ordering::SeqCst)
    }

    pub fn begin_calls(&self) -> usize {
        self.state.begin_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Statements executed inside transactions, in order
    pub fn transaction_statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    pub fn transaction_outcomes(&self) -> Vec<TransactionOutcome> {
        self.state.outcomes.lock().clone()
    }

    fn check_statement_error(&self) -> ClusterResult<()> {
        match self.state.statement_error.lock().as_ref() {
            Some(message) => Err(ClusterError::Database(message.clone())),
            None => Ok(()),
        }
    }

    fn answer(&self, sql: &str) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        self.check_statement_error()?;
        let value = self
            .state
            .results
            .read()
            .get(&normalize(sql))
            .cloned()
            .ok_or_else(|| {
                ClusterError::Database(format!("{}: no result for '{}'", self.state.name, sql))
            })?;

        Ok(vec![Box::new(MockRow::single("?column?", value))])
    }
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn query(&self, sql: &str, _params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        self.state.query_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(sql)
    }

    async fn execute(&self, _sql: &str, _params: &[DatabaseValue]) -> ClusterResult<u64> {
        self.state.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.check_statement_error()?;
        Ok(1)
    }

    async fn begin_transaction(&self) -> ClusterResult<Box<dyn DatabaseTransaction>> {
        self.state.begin_calls.fetch_add(1, Ordering::SeqCst);
        self.check_statement_error()?;
        Ok(Box::new(MockTransaction {
            executor: self.clone(),
        }))
    }

    async fn ping(&self) -> ClusterResult<()> {
        self.state.ping_calls.fetch_add(1, Ordering::SeqCst);

        let consumed = self
            .state
            .ping_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(ClusterError::Database(format!("{}: ping refused", self.state.name)));
        }

        let mode = self.state.ping_mode.lock().clone();
        match mode {
            PingMode::Healthy => Ok(()),
            PingMode::Failing(message) => Err(ClusterError::Database(message)),
            PingMode::Hanging => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockTransaction {
    executor: MockExecutor,
}

#[async_trait]
impl DatabaseTransaction for MockTransaction {
    async fn query(&mut self, sql: &str, _params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>> {
        self.executor.state.statements.lock().push(sql.to_string());
        self.executor.answer(sql)
    }

    async fn execute(&mut self, sql: &str, _params: &[DatabaseValue]) -> ClusterResult<u64> {
        self.executor.check_statement_error()?;
        self.executor.state.statements.lock().push(sql.to_string());
        Ok(1)
    }

    async fn commit(self: Box<Self>) -> ClusterResult<()> {
        self.executor.state.outcomes.lock().push(TransactionOutcome::Committed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ClusterResult<()> {
        self.executor.state.outcomes.lock().push(TransactionOutcome::RolledBack);
        Ok(())
    }
}

/// Row with fixed columns
#[derive(Debug, Clone)]
pub struct MockRow {
    columns: Vec<(String, DatabaseValue)>,
}

impl MockRow {
    pub fn new(columns: Vec<(String, DatabaseValue)>) -> Self {
        Self { columns }
    }

    pub fn single(name: &str, value: DatabaseValue) -> Self {
        Self::new(vec![(name.to_string(), value)])
    }
}

impl DatabaseRow for MockRow {
    fn get_by_index(&self, index: usize) -> ClusterResult<DatabaseValue> {
        self.columns
            .get(index)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| ClusterError::Decode(format!("column index {} out of range", index)))
    }

    fn get_by_name(&self, name: &str) -> ClusterResult<DatabaseValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| ClusterError::Decode(format!("column '{}' not found", name)))
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Hands out registered `MockExecutor`s by endpoint address
#[derive(Debug, Default)]
pub struct MockConnector {
    executors: RwLock<HashMap<String, MockExecutor>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `executor` for the endpoint described by `url`
    pub fn register(&self, url: &str, executor: MockExecutor) -> Result<ConnectionOptions, ConfigError> {
        let options = ConnectionOptions::from_url(url)?;
        self.executors.write().insert(options.address(), executor);
        Ok(options)
    }

    pub fn connect_calls(&self, options: &ConnectionOptions) -> usize {
        self.connects.lock().get(&options.address()).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, options: &ConnectionOptions) -> ClusterResult<Box<dyn SqlExecutor>> {
        let address = options.address();
        *self.connects.lock().entry(address.clone()).or_insert(0) += 1;

        self.executors
            .read()
            .get(&address)
            .cloned()
            .map(|executor| Box::new(executor) as Box<dyn SqlExecutor>)
            .ok_or_else(|| ClusterError::Connection(format!("{}: connection refused", address)))
    }
}

fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(';').trim().to_lowercase()
}
