//! Warehouse Pool Library
//!
//! This library provides a bounded session pool for a remote analytic
//! warehouse, an instrumented query executor, transaction and batch helpers,
//! and an in-process metrics registry.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod sql;

pub use config::{Config, PoolConfig, ReleasePolicy};
pub use db::{Lease, QueryExecutor, SqlxDriver, Transaction, WarehousePool};
pub use error::{DbError, DbResult, DriverError};
pub use metrics::{MetricsRegistry, MetricsSnapshot, QueryMetrics};
pub use models::{QueryParam, Row};
