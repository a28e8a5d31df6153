//! Execution Backends
//!
//! The traits the routing layer executes through, and the sqlx PostgreSQL
//! implementation of them.

pub mod core;
pub mod postgres;

pub use self::core::*;
pub use postgres::{PostgresConnector, PostgresExecutor};
