//! Caller-facing pool manager.
//!
//! [`WarehousePool`] ties the session pool, executor, health monitor and retry
//! policy together behind one explicitly owned instance. The owner decides
//! its lifecycle: [`start`](WarehousePool::start) launches the health monitor
//! and the startup connectivity probe, [`cleanup`](WarehousePool::cleanup)
//! stops the monitor and destroys every session.

use super::driver::Driver;
use super::executor::QueryExecutor;
use super::health::HealthMonitor;
use super::pool::{Lease, PoolStatus, SessionPool};
use super::retry::RetryPolicy;
use super::transaction::Transaction;
use crate::config::PoolConfig;
use crate::error::DbResult;
use crate::metrics::MetricsRegistry;
use crate::models::{QueryParam, Row};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Pooled, instrumented access to the warehouse.
pub struct WarehousePool {
    executor: QueryExecutor,
    retry: RetryPolicy,
    /// Health monitor task. Uses std::sync::Mutex so Drop can abort it.
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WarehousePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehousePool")
            .field("config", self.executor.pool().config())
            .field("status", &self.status())
            .field("retry", &self.retry)
            .finish()
    }
}

impl WarehousePool {
    /// Build a pool with its own metrics registry.
    ///
    /// Fails with a configuration error if any required setting is missing.
    /// No session is opened until [`start`](Self::start) or the first acquire.
    pub fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> DbResult<Self> {
        Self::with_metrics(config, driver, Arc::new(MetricsRegistry::new()))
    }

    /// Build a pool that records into an existing registry.
    pub fn with_metrics(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        metrics: Arc<MetricsRegistry>,
    ) -> DbResult<Self> {
        let retry = RetryPolicy::from_config(&config);
        let pool = SessionPool::new(config, driver, metrics)?;
        info!(
            account = %pool.config().account,
            database = %pool.config().database,
            warehouse = %pool.config().warehouse,
            schema = %pool.config().schema,
            pool_size = pool.config().pool_size,
            release_policy = %pool.config().release_policy,
            "Warehouse pool configured"
        );
        Ok(Self {
            executor: QueryExecutor::new(pool),
            retry,
            monitor: Mutex::new(None),
        })
    }

    /// Launch the health monitor and a one-off connectivity probe.
    ///
    /// The returned handle resolves once the probe has run `SELECT 1` (or
    /// failed to). Calling `start` again does not launch a second monitor.
    pub fn start(&self) -> JoinHandle<DbResult<()>> {
        {
            let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
            if monitor.is_none() {
                let health = HealthMonitor::new(self.executor.pool());
                info!(
                    interval_ms = health.interval().as_millis() as u64,
                    "Starting health monitor"
                );
                *monitor = Some(health.spawn());
            }
        }

        let executor = self.executor.clone();
        tokio::spawn(async move {
            match executor.execute("SELECT 1", &[], None).await {
                Ok(_) => {
                    info!("Startup connectivity probe succeeded");
                    Ok(())
                }
                Err(e) => {
                    error!(
                        code = %e.code(),
                        error = %e,
                        suggestion = e.suggestion().unwrap_or(""),
                        "Startup connectivity probe failed"
                    );
                    Err(e)
                }
            }
        })
    }

    /// Lease a session for a multi-statement sequence.
    pub async fn get_connection(&self) -> DbResult<Lease> {
        self.executor.pool().acquire().await
    }

    /// Give back a lease obtained from [`get_connection`](Self::get_connection).
    pub async fn release_connection(&self, lease: Lease) {
        self.executor.pool().release(lease).await;
    }

    /// Execute one statement, on `lease` if given, otherwise on a pooled
    /// session that is returned before this call completes.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[QueryParam],
        lease: Option<&mut Lease>,
    ) -> DbResult<Vec<Row>> {
        self.executor.execute(sql, params, lease).await
    }

    /// [`execute_query`](Self::execute_query) on an owned session, retried per
    /// the configured `max_retries` / `retry_delay` when the failure is
    /// retryable.
    pub async fn execute_query_with_retry(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        self.retry
            .run(move || self.executor.execute(sql, params, None))
            .await
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<Vec<Vec<Row>>> {
        self.executor.execute_batch(sql, param_sets).await
    }

    /// See [`QueryExecutor::execute_transaction`].
    pub async fn execute_transaction<T, F>(&self, op: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        self.executor.execute_transaction(op).await
    }

    /// Stop the health monitor and destroy every session.
    pub async fn cleanup(&self) {
        self.stop_monitor();
        self.executor.pool().cleanup().await;
    }

    pub fn status(&self) -> PoolStatus {
        self.executor.pool().status()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.executor.pool().metrics()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn stop_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = monitor.take() {
            handle.abort();
        }
    }
}

impl Drop for WarehousePool {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDriver;
    use crate::error::DbError;
    use std::time::Duration;

    fn config() -> PoolConfig {
        PoolConfig {
            pool_size: 2,
            connection_timeout_ms: 100,
            retry_delay_ms: 1,
            ..PoolConfig::new("acct", "user", "pw", "DB", "WH")
        }
    }

    #[test]
    fn test_missing_config_fails_construction() {
        let bad = PoolConfig {
            warehouse: String::new(),
            ..config()
        };
        let err = WarehousePool::new(bad, Arc::new(FakeDriver::new())).unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_start_probes_connectivity() {
        let driver = FakeDriver::new();
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        pool.start().await.unwrap().unwrap();
        assert_eq!(driver.statements(), vec!["SELECT 1".to_string()]);
        assert_eq!(pool.status().idle, 1);
        pool.cleanup().await;
    }

    #[tokio::test]
    async fn test_start_probe_reports_connect_failure() {
        let driver = FakeDriver::new();
        driver.fail_next_connects(1);
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        let err = pool.start().await.unwrap().unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        pool.cleanup().await;
    }

    #[tokio::test]
    async fn test_get_and_release_connection() {
        let driver = FakeDriver::new();
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        let mut lease = pool.get_connection().await.unwrap();
        pool.execute_query("SELECT 1", &[], Some(&mut lease))
            .await
            .unwrap();
        pool.execute_query("SELECT 2", &[], Some(&mut lease))
            .await
            .unwrap();
        assert_eq!(pool.status().busy, 1);
        pool.release_connection(lease).await;
        assert_eq!(pool.status().busy, 0);
        assert_eq!(driver.connects(), 1);
    }

    #[tokio::test]
    async fn test_execute_query_with_retry_recovers_from_connect_failure() {
        let driver = FakeDriver::new();
        driver.fail_next_connects(2);
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        let rows = pool.execute_query_with_retry("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(pool.metrics().snapshot().connection_errors_for("1003"), 2);
    }

    #[tokio::test]
    async fn test_plain_execute_does_not_retry() {
        let driver = FakeDriver::new();
        driver.fail_next_connects(1);
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        assert!(pool.execute_query("SELECT 1", &[], None).await.is_err());
        assert_eq!(driver.connects(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_drains_and_rejects() {
        let driver = FakeDriver::new();
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();
        pool.start().await.unwrap().unwrap();

        pool.cleanup().await;
        assert_eq!(pool.status().total, 0);
        assert_eq!(driver.closed(), 1);
        assert!(matches!(
            pool.execute_query("SELECT 1", &[], None).await,
            Err(DbError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_transaction_and_batch_through_facade() {
        let driver = FakeDriver::new();
        let pool = WarehousePool::new(config(), Arc::new(driver.clone())).unwrap();

        pool.execute_transaction(|tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO t VALUES (1)", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let results = pool
            .execute_batch("SELECT ?", &[vec![QueryParam::Int(1)], vec![QueryParam::Int(2)]])
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.status().busy, 0);
    }
}
