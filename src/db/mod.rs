//! Session pooling and query execution.
//!
//! This module provides:
//! - The driver seam and a sqlx-backed driver
//! - The bounded session pool and its leases
//! - Periodic health sweeps
//! - Instrumented query execution, transactions and batches
//! - Opt-in retries
//! - The caller-facing [`WarehousePool`]

pub mod driver;
pub mod executor;
pub mod health;
pub mod manager;
pub(crate) mod params;
pub mod pool;
pub mod retry;
pub mod sqlx_driver;
pub mod transaction;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use driver::{Driver, DriverSession};
pub use executor::QueryExecutor;
pub use health::{HealthMonitor, SweepReport};
pub use manager::WarehousePool;
pub use pool::{Lease, PoolStatus, SessionPool};
pub use retry::RetryPolicy;
pub use sqlx_driver::{Backend, SqlxDriver};
pub use transaction::Transaction;
