//! Instrumented query execution.
//!
//! Every statement is sanitized, classified for the metric `type` label,
//! tagged with a SQL-prefix `source` label, dispatched with positional binds
//! and timed start to finish (failures included). Failures are logged with
//! their code and SQL state, counted, and returned to the caller; nothing is
//! retried here.
//!
//! # Ownership
//!
//! [`QueryExecutor::execute`] without a lease acquires one, and gives it back
//! exactly once on every exit path: released on success, discarded on
//! failure. With a caller-supplied lease the caller keeps ownership and stays
//! responsible for releasing it.

use super::pool::{Lease, SessionPool};
use crate::config::SLOW_QUERY_THRESHOLD;
use crate::error::{DbError, DbResult, DriverError, ErrorCode};
use crate::metrics::{MetricsRegistry, QueryMetrics};
use crate::models::{QueryParam, Row};
use crate::sql::{self, StatementKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Executes statements on pooled sessions and records their metrics.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: SessionPool,
    metrics: Arc<MetricsRegistry>,
    query_timeout: Duration,
    slow_query_threshold: Duration,
}

impl QueryExecutor {
    pub fn new(pool: SessionPool) -> Self {
        Self {
            metrics: pool.metrics(),
            query_timeout: pool.config().query_timeout(),
            slow_query_threshold: SLOW_QUERY_THRESHOLD,
            pool,
        }
    }

    /// Override the slow-query threshold.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Execute one statement, on the given lease or on a freshly acquired one.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        lease: Option<&mut Lease>,
    ) -> DbResult<Vec<Row>> {
        match lease {
            Some(lease) => self.execute_on(lease, sql, params).await,
            None => self.execute_owned(sql, params).await,
        }
    }

    async fn execute_owned(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let mut lease = self.pool.acquire().await?;
        let result = self.execute_on(&mut lease, sql, params).await;
        match &result {
            Ok(_) => self.pool.release(lease).await,
            Err(_) => self.pool.discard(lease).await,
        }
        result
    }

    /// Execute one statement on a caller-held lease. The lease is not released.
    pub async fn execute_on(
        &self,
        lease: &mut Lease,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<Row>> {
        let sanitized = sql::sanitize(sql);
        let source = sql::source_tag(&sanitized);
        let kind = sql::classify(&sanitized);

        if sanitized.is_empty() {
            let err = DriverError::new("Statement is empty after sanitization")
                .with_code(ErrorCode::QueryError.as_str());
            return Err(self.record_failure(kind, &source, &sanitized, Duration::ZERO, &err));
        }

        debug!(
            session_id = lease.session_id(),
            kind = %kind,
            params = ?params.iter().map(QueryParam::type_name).collect::<Vec<_>>(),
            "Executing query"
        );

        let started = Instant::now();
        let outcome = lease.run(&sanitized, params, self.query_timeout).await;
        let elapsed = started.elapsed();

        if elapsed > self.slow_query_threshold {
            self.metrics.record_slow_query(&source);
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_query_threshold.as_millis() as u64,
                source = %source,
                sql = %sql::preview(&sanitized),
                "Slow query"
            );
        }

        match outcome {
            Ok(rows) => {
                let record = QueryMetrics::success(elapsed, rows.len());
                self.metrics.record_query(&record, kind, &source);
                debug!(
                    query_id = %record.query_id,
                    session_id = lease.session_id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows = record.row_count,
                    "Query complete"
                );
                Ok(rows)
            }
            Err(e) => {
                // The session is in an unknown state after a transport failure
                // or a statement that was cut off by its timeout.
                let code = e.code_or(ErrorCode::QueryError);
                if code == ErrorCode::ConnectionError.as_str()
                    || code == ErrorCode::StatementTimeout.as_str()
                {
                    lease.mark_broken();
                }
                Err(self.record_failure(kind, &source, &sanitized, elapsed, &e))
            }
        }
    }

    fn record_failure(
        &self,
        kind: StatementKind,
        source: &str,
        sanitized: &str,
        elapsed: Duration,
        err: &DriverError,
    ) -> DbError {
        let record = QueryMetrics::failure(elapsed, err.message.clone());
        self.metrics.record_query(&record, kind, source);

        let db_err = DbError::from_statement(err, source);
        let code = db_err.code();
        self.metrics.record_query_error(&code, source);
        error!(
            query_id = %record.query_id,
            code = %code,
            sql_state = err.sql_state.as_deref().unwrap_or(""),
            elapsed_ms = elapsed.as_millis() as u64,
            sql = %sql::preview(sanitized),
            error = %err,
            "Query failed"
        );
        db_err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::fake::FakeDriver;

    fn executor(driver: &FakeDriver, pool_size: u32) -> QueryExecutor {
        let config = PoolConfig {
            pool_size,
            connection_timeout_ms: 1_000,
            ..PoolConfig::new("acct", "user", "pw", "DB", "WH")
        };
        let pool = SessionPool::new(
            config,
            Arc::new(driver.clone()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        QueryExecutor::new(pool)
    }

    #[tokio::test]
    async fn test_owned_lease_released_on_success() {
        let driver = FakeDriver::new();
        let exec = executor(&driver, 2);

        let rows = exec.execute("SELECT 1", &[], None).await.unwrap();
        assert_eq!(rows.len(), 1);
        let status = exec.pool().status();
        assert_eq!((status.busy, status.idle), (0, 1));

        let snap = exec.metrics.snapshot();
        assert_eq!(snap.queries_total, 1);
        assert_eq!(snap.rows_returned, 1);
    }

    #[tokio::test]
    async fn test_sql_is_sanitized_before_dispatch() {
        let driver = FakeDriver::new();
        let exec = executor(&driver, 1);

        exec.execute("SELECT 1; DROP TABLE t; -- comment", &[], None)
            .await
            .unwrap();
        assert_eq!(driver.statements(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_is_counted_and_owned_session_destroyed() {
        let driver = FakeDriver::new();
        driver.fail_on(
            "missing",
            DriverError::new("relation \"missing\" does not exist")
                .with_code("42P01")
                .with_sql_state("42P01"),
        );
        let exec = executor(&driver, 1);

        let err = exec
            .execute("SELECT * FROM missing", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "42P01");
        assert!(matches!(err, DbError::Query { .. }));

        let status = exec.pool().status();
        assert_eq!((status.busy, status.total), (0, 0));
        assert_eq!(driver.closed(), 1);

        let snap = exec.metrics.snapshot();
        assert_eq!(snap.query_errors_for("42P01", "SELECT * FROM missing"), 1);
        assert_eq!(snap.queries_failed, 1);

        // capacity is available again
        exec.execute("SELECT 1", &[], None).await.unwrap();
    }

    #[tokio::test]
    async fn test_borrowed_lease_is_not_released() {
        let driver = FakeDriver::new();
        let exec = executor(&driver, 1);
        let mut lease = exec.pool().acquire().await.unwrap();

        exec.execute("INSERT INTO t VALUES (1)", &[QueryParam::Int(1)], Some(&mut lease))
            .await
            .unwrap();
        exec.execute("SELECT 1", &[], Some(&mut lease)).await.unwrap();
        assert_eq!(exec.pool().status().busy, 1);
        assert!(!lease.is_executing());

        exec.pool().release(lease).await;
        assert_eq!(exec.pool().status().busy, 0);
    }

    #[tokio::test]
    async fn test_borrowed_lease_survives_statement_error() {
        let driver = FakeDriver::new();
        driver.fail_on("dup", DriverError::new("duplicate key").with_code("23505"));
        let exec = executor(&driver, 1);
        let mut lease = exec.pool().acquire().await.unwrap();

        assert!(exec.execute("INSERT dup", &[], Some(&mut lease)).await.is_err());
        assert!(!lease.is_broken());
        assert_eq!(exec.pool().status().busy, 1);
        exec.pool().release(lease).await;
        assert_eq!(exec.pool().status().idle, 1);
    }

    #[tokio::test]
    async fn test_slow_query_counted_once_per_source() {
        let driver = FakeDriver::new();
        driver.delay_on("big_table", Duration::from_millis(350));
        let exec = executor(&driver, 1);

        exec.execute("SELECT * FROM big_table", &[], None)
            .await
            .unwrap();
        exec.execute("SELECT 1", &[], None).await.unwrap();

        let snap = exec.metrics.snapshot();
        assert_eq!(snap.slow_queries_for("SELECT * FROM big_table"), 1);
        assert_eq!(snap.slow_queries_total(), 1);
    }

    #[tokio::test]
    async fn test_statement_timeout_breaks_session() {
        let driver = FakeDriver::new();
        driver.delay_on("sleepy", Duration::from_secs(60));
        let config = PoolConfig {
            pool_size: 1,
            query_timeout_ms: 50,
            ..PoolConfig::new("acct", "user", "pw", "DB", "WH")
        };
        let pool = SessionPool::new(
            config,
            Arc::new(driver.clone()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let exec = QueryExecutor::new(pool);

        let mut lease = exec.pool().acquire().await.unwrap();
        let err = exec
            .execute("SELECT sleepy", &[], Some(&mut lease))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "1002");
        assert!(lease.is_broken());
        exec.pool().release(lease).await;
        assert_eq!(exec.pool().status().total, 0);
    }

    #[tokio::test]
    async fn test_empty_statement_rejected_without_dispatch() {
        let driver = FakeDriver::new();
        let exec = executor(&driver, 1);

        let err = exec.execute("-- nothing", &[], None).await.unwrap_err();
        assert_eq!(err.code(), "1004");
        assert!(driver.statements().is_empty());
    }

    #[tokio::test]
    async fn test_one_statement_per_session_under_concurrency() {
        let driver = FakeDriver::new();
        driver.delay_on("work", Duration::from_millis(20));
        let exec = executor(&driver, 2);

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let exec = exec.clone();
            tasks.push(tokio::spawn(async move {
                exec.execute("SELECT work", &[], None).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(driver.peak_executing() <= 2);
        assert!(driver.peak_open() <= 2);
    }
}
