//! Core Execution Traits
//!
//! The routing layer never talks to a driver directly. Every endpoint is reached
//! through a `SqlExecutor`, and endpoints are opened through a `Connector`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::config::ConnectionOptions;
use crate::error::{ClusterError, ClusterResult};

/// Statement issued by a liveness probe
pub const PING_SQL: &str = "SELECT 1";

/// Execution interface for a single endpoint
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a query and return its rows
    async fn query(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>>;

    /// Run a statement and return the affected rows count
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<u64>;

    /// Begin a transaction on this endpoint
    async fn begin_transaction(&self) -> ClusterResult<Box<dyn DatabaseTransaction>>;

    /// Liveness check
    async fn ping(&self) -> ClusterResult<()> {
        self.execute(PING_SQL, &[]).await.map(|_| ())
    }

    /// Release the underlying resources
    async fn close(&self);
}

/// Backend transaction
#[async_trait]
pub trait DatabaseTransaction: Send + Sync {
    async fn query(&mut self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<Vec<Box<dyn DatabaseRow>>>;

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> ClusterResult<u64>;

    async fn commit(self: Box<Self>) -> ClusterResult<()>;

    async fn rollback(self: Box<Self>) -> ClusterResult<()>;
}

/// Opens executors for endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> ClusterResult<Box<dyn SqlExecutor>>;
}

/// Abstract database row
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by index
    fn get_by_index(&self, index: usize) -> ClusterResult<DatabaseValue>;

    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> ClusterResult<DatabaseValue>;

    fn column_count(&self) -> usize;

    fn column_names(&self) -> Vec<String>;

    /// Convert row to a JSON object keyed by column name
    fn to_json(&self) -> ClusterResult<JsonValue> {
        let mut map = serde_json::Map::new();
        for (i, name) in self.column_names().into_iter().enumerate() {
            map.insert(name, self.get_by_index(i)?.to_json());
        }
        Ok(JsonValue::Object(map))
    }

    fn to_map(&self) -> ClusterResult<HashMap<String, DatabaseValue>> {
        let mut map = HashMap::new();
        for (i, name) in self.column_names().into_iter().enumerate() {
            map.insert(name, self.get_by_index(i)?);
        }
        Ok(map)
    }
}

/// Typed column access on top of `DatabaseRow`
pub trait DatabaseRowExt {
    /// Decode a named column into `T`
    fn get<T: DeserializeOwned>(&self, column: &str) -> ClusterResult<T>;

    /// Decode the column at `index` into `T`
    fn get_at<T: DeserializeOwned>(&self, index: usize) -> ClusterResult<T>;
}

impl<R: DatabaseRow + ?Sized> DatabaseRowExt for R {
    fn get<T: DeserializeOwned>(&self, column: &str) -> ClusterResult<T> {
        let value = self.get_by_name(column)?;
        serde_json::from_value(value.to_json())
            .map_err(|e| ClusterError::Decode(format!("column '{}': {}", column, e)))
    }

    fn get_at<T: DeserializeOwned>(&self, index: usize) -> ClusterResult<T> {
        let value = self.get_by_index(index)?;
        serde_json::from_value(value.to_json())
            .map_err(|e| ClusterError::Decode(format!("column {}: {}", index, e)))
    }
}

/// Decode the first column of the first row
pub fn first_scalar<T: DeserializeOwned>(rows: &[Box<dyn DatabaseRow>]) -> ClusterResult<T> {
    let row = rows
        .first()
        .ok_or_else(|| ClusterError::Decode("query returned no rows".to_string()))?;
    row.get_at(0)
}

/// Database value enumeration for parameter binding and result access
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::from(*i),
            DatabaseValue::Int64(i) => JsonValue::from(*i),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(b.iter().map(|&x| JsonValue::from(x)).collect()),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}
