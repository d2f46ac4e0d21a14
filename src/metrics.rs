//! In-process metrics for the session pool and query executor.
//!
//! Counters, histograms and gauges live behind one mutex and are cheap to
//! update on the query path. [`MetricsRegistry::render_prometheus`] produces
//! the text exposition format for whatever scrape endpoint the host service
//! exposes; [`MetricsRegistry::snapshot`] gives a typed view for tests and
//! status reports.

use crate::sql::StatementKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Upper bounds (milliseconds) of the query duration histogram buckets.
pub const DURATION_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 300.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
    30_000.0,
];

/// Per-call record of one query execution.
///
/// Transient: it only feeds the aggregates below and the structured logs.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub query_id: Uuid,
    pub execution_time: Duration,
    pub row_count: usize,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryMetrics {
    /// Record for a successful call.
    pub fn success(execution_time: Duration, row_count: usize) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            execution_time,
            row_count,
            timestamp: Utc::now(),
            success: true,
            error: None,
        }
    }

    /// Record for a failed call.
    pub fn failure(execution_time: Duration, error: impl Into<String>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            execution_time,
            row_count: 0,
            timestamp: Utc::now(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn status(&self) -> &'static str {
        if self.success { "success" } else { "error" }
    }
}

#[derive(Debug, Clone, Default)]
struct Histogram {
    /// Non-cumulative counts; the last slot is the +Inf overflow bucket.
    buckets: Vec<u64>,
    sum_ms: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value_ms: f64) {
        if self.buckets.is_empty() {
            self.buckets = vec![0; DURATION_BUCKETS_MS.len() + 1];
        }
        let idx = DURATION_BUCKETS_MS
            .iter()
            .position(|bound| value_ms <= *bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.buckets[idx] += 1;
        self.sum_ms += value_ms;
        self.count += 1;
    }
}

/// Labels of the query duration histogram: (type, status, source).
type DurationKey = (String, String, String);

#[derive(Debug, Default)]
struct Inner {
    query_duration: BTreeMap<DurationKey, Histogram>,
    slow_queries: BTreeMap<String, u64>,
    query_errors: BTreeMap<(String, String), u64>,
    connection_errors: BTreeMap<String, u64>,
    rows_returned: BTreeMap<String, u64>,
    sessions_busy: u64,
    sessions_idle: u64,
    max_pool_size: u64,
    sessions_created: u64,
    sessions_destroyed: u64,
    health_checks: u64,
    health_check_failures: u64,
}

impl Inner {
    fn utilization(&self) -> f64 {
        if self.max_pool_size == 0 {
            return 0.0;
        }
        self.sessions_busy as f64 / self.max_pool_size as f64
    }
}

/// Counters, histograms and gauges for one pool.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    inner: Mutex<Inner>,
}

/// Query error count for one (code, source) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub code: String,
    pub source: String,
    pub count: u64,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_failed: u64,
    pub slow_queries: BTreeMap<String, u64>,
    pub query_errors: Vec<ErrorCount>,
    pub connection_errors: BTreeMap<String, u64>,
    pub rows_returned: u64,
    pub sessions_busy: u64,
    pub sessions_idle: u64,
    pub max_pool_size: u64,
    pub utilization: f64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub health_checks: u64,
    pub health_check_failures: u64,
}

impl MetricsSnapshot {
    /// Slow queries recorded for a source tag.
    pub fn slow_queries_for(&self, source: &str) -> u64 {
        self.slow_queries.get(source).copied().unwrap_or(0)
    }

    /// Total slow queries across sources.
    pub fn slow_queries_total(&self) -> u64 {
        self.slow_queries.values().sum()
    }

    /// Query errors recorded for a (code, source) pair.
    pub fn query_errors_for(&self, code: &str, source: &str) -> u64 {
        self.query_errors
            .iter()
            .find(|e| e.code == code && e.source == source)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Connection errors recorded for a code.
    pub fn connection_errors_for(&self, code: &str) -> u64 {
        self.connection_errors.get(code).copied().unwrap_or(0)
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of one query.
    pub fn record_query(&self, record: &QueryMetrics, kind: StatementKind, source: &str) {
        let mut inner = self.lock();
        let key = (
            kind.as_str().to_string(),
            record.status().to_string(),
            source.to_string(),
        );
        inner
            .query_duration
            .entry(key)
            .or_default()
            .observe(record.execution_time.as_secs_f64() * 1_000.0);
        if record.success {
            *inner.rows_returned.entry(source.to_string()).or_default() +=
                record.row_count as u64;
        }
    }

    /// Count a query that exceeded the slow-query threshold.
    pub fn record_slow_query(&self, source: &str) {
        *self.lock().slow_queries.entry(source.to_string()).or_default() += 1;
    }

    /// Count a failed query by error code and source tag.
    pub fn record_query_error(&self, code: &str, source: &str) {
        *self
            .lock()
            .query_errors
            .entry((code.to_string(), source.to_string()))
            .or_default() += 1;
    }

    /// Count a failure to establish or destroy a session.
    pub fn record_connection_error(&self, code: &str) {
        *self
            .lock()
            .connection_errors
            .entry(code.to_string())
            .or_default() += 1;
    }

    /// Update the busy/idle gauges. Called on every acquire and release.
    pub fn set_pool_state(&self, busy: u32, idle: u32, max: u32) {
        let mut inner = self.lock();
        inner.sessions_busy = busy.into();
        inner.sessions_idle = idle.into();
        inner.max_pool_size = max.into();
    }

    pub fn session_created(&self) {
        self.lock().sessions_created += 1;
    }

    pub fn session_destroyed(&self) {
        self.lock().sessions_destroyed += 1;
    }

    /// Count one health probe.
    pub fn record_health_check(&self, healthy: bool) {
        let mut inner = self.lock();
        inner.health_checks += 1;
        if !healthy {
            inner.health_check_failures += 1;
        }
    }

    /// Current busy / max ratio.
    pub fn utilization(&self) -> f64 {
        self.lock().utilization()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let (queries_total, queries_failed) = inner.query_duration.iter().fold(
            (0, 0),
            |(total, failed), ((_, status, _), hist)| {
                let failed = if status == "error" {
                    failed + hist.count
                } else {
                    failed
                };
                (total + hist.count, failed)
            },
        );

        MetricsSnapshot {
            queries_total,
            queries_failed,
            slow_queries: inner.slow_queries.clone(),
            query_errors: inner
                .query_errors
                .iter()
                .map(|((code, source), count)| ErrorCount {
                    code: code.clone(),
                    source: source.clone(),
                    count: *count,
                })
                .collect(),
            connection_errors: inner.connection_errors.clone(),
            rows_returned: inner.rows_returned.values().sum(),
            sessions_busy: inner.sessions_busy,
            sessions_idle: inner.sessions_idle,
            max_pool_size: inner.max_pool_size,
            utilization: inner.utilization(),
            sessions_created: inner.sessions_created,
            sessions_destroyed: inner.sessions_destroyed,
            health_checks: inner.health_checks,
            health_check_failures: inner.health_check_failures,
        }
    }

    /// Render all metrics in the text exposition format.
    pub fn render_prometheus(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();

        out.push_str("# HELP warehouse_query_duration_ms Query execution time in milliseconds.\n");
        out.push_str("# TYPE warehouse_query_duration_ms histogram\n");
        for ((kind, status, source), hist) in &inner.query_duration {
            let labels = format!(
                "type=\"{}\",status=\"{}\",source=\"{}\"",
                escape(kind),
                escape(status),
                escape(source)
            );
            let mut cumulative = 0;
            for (bound, count) in DURATION_BUCKETS_MS.iter().zip(&hist.buckets) {
                cumulative += count;
                let _ = writeln!(
                    out,
                    "warehouse_query_duration_ms_bucket{{{},le=\"{}\"}} {}",
                    labels, bound, cumulative
                );
            }
            let _ = writeln!(
                out,
                "warehouse_query_duration_ms_bucket{{{},le=\"+Inf\"}} {}",
                labels, hist.count
            );
            let _ = writeln!(out, "warehouse_query_duration_ms_sum{{{}}} {}", labels, hist.sum_ms);
            let _ = writeln!(out, "warehouse_query_duration_ms_count{{{}}} {}", labels, hist.count);
        }

        out.push_str("# HELP warehouse_slow_queries_total Queries slower than the slow-query threshold.\n");
        out.push_str("# TYPE warehouse_slow_queries_total counter\n");
        for (source, count) in &inner.slow_queries {
            let _ = writeln!(
                out,
                "warehouse_slow_queries_total{{source=\"{}\"}} {}",
                escape(source),
                count
            );
        }

        out.push_str("# HELP warehouse_query_errors_total Failed queries by error code and source.\n");
        out.push_str("# TYPE warehouse_query_errors_total counter\n");
        for ((code, source), count) in &inner.query_errors {
            let _ = writeln!(
                out,
                "warehouse_query_errors_total{{code=\"{}\",source=\"{}\"}} {}",
                escape(code),
                escape(source),
                count
            );
        }

        out.push_str("# HELP warehouse_connection_errors_total Session connect/destroy failures by error code.\n");
        out.push_str("# TYPE warehouse_connection_errors_total counter\n");
        for (code, count) in &inner.connection_errors {
            let _ = writeln!(
                out,
                "warehouse_connection_errors_total{{code=\"{}\"}} {}",
                escape(code),
                count
            );
        }

        out.push_str("# HELP warehouse_query_rows_total Rows returned by successful queries.\n");
        out.push_str("# TYPE warehouse_query_rows_total counter\n");
        for (source, count) in &inner.rows_returned {
            let _ = writeln!(
                out,
                "warehouse_query_rows_total{{source=\"{}\"}} {}",
                escape(source),
                count
            );
        }

        out.push_str("# HELP warehouse_pool_utilization Busy sessions divided by the maximum pool size.\n");
        out.push_str("# TYPE warehouse_pool_utilization gauge\n");
        let _ = writeln!(out, "warehouse_pool_utilization {}", inner.utilization());

        out.push_str("# HELP warehouse_pool_sessions Live sessions by state.\n");
        out.push_str("# TYPE warehouse_pool_sessions gauge\n");
        let _ = writeln!(out, "warehouse_pool_sessions{{state=\"busy\"}} {}", inner.sessions_busy);
        let _ = writeln!(out, "warehouse_pool_sessions{{state=\"idle\"}} {}", inner.sessions_idle);

        out.push_str("# TYPE warehouse_sessions_created_total counter\n");
        let _ = writeln!(out, "warehouse_sessions_created_total {}", inner.sessions_created);
        out.push_str("# TYPE warehouse_sessions_destroyed_total counter\n");
        let _ = writeln!(out, "warehouse_sessions_destroyed_total {}", inner.sessions_destroyed);

        out.push_str("# TYPE warehouse_health_checks_total counter\n");
        let _ = writeln!(
            out,
            "warehouse_health_checks_total{{result=\"ok\"}} {}",
            inner.health_checks - inner.health_check_failures
        );
        let _ = writeln!(
            out,
            "warehouse_health_checks_total{{result=\"failed\"}} {}",
            inner.health_check_failures
        );

        out
    }
}

/// Escape a label value for the text exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_metrics_serialize_with_id() {
        let record = QueryMetrics::failure(Duration::from_millis(12), "syntax error");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["query_id"], serde_json::json!(record.query_id.to_string()));
        assert_eq!(json["success"], serde_json::json!(false));
        assert_eq!(json["error"], serde_json::json!("syntax error"));
    }

    #[test]
    fn test_record_query_counts_by_status() {
        let registry = MetricsRegistry::new();
        registry.record_query(
            &QueryMetrics::success(Duration::from_millis(12), 3),
            StatementKind::Select,
            "SELECT * FROM words",
        );
        registry.record_query(
            &QueryMetrics::failure(Duration::from_millis(4), "boom"),
            StatementKind::Dml,
            "INSERT INTO words",
        );

        let snap = registry.snapshot();
        assert_eq!(snap.queries_total, 2);
        assert_eq!(snap.queries_failed, 1);
        assert_eq!(snap.rows_returned, 3);
    }

    #[test]
    fn test_error_and_slow_counters() {
        let registry = MetricsRegistry::new();
        registry.record_slow_query("SELECT big");
        registry.record_slow_query("SELECT big");
        registry.record_query_error("42P01", "SELECT * FROM missing");
        registry.record_connection_error("1003");

        let snap = registry.snapshot();
        assert_eq!(snap.slow_queries_for("SELECT big"), 2);
        assert_eq!(snap.slow_queries_total(), 2);
        assert_eq!(snap.query_errors_for("42P01", "SELECT * FROM missing"), 1);
        assert_eq!(snap.query_errors_for("42P01", "other"), 0);
        assert_eq!(snap.connection_errors_for("1003"), 1);
    }

    #[test]
    fn test_utilization_gauge() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.utilization(), 0.0);
        registry.set_pool_state(2, 1, 4);
        assert!((registry.utilization() - 0.5).abs() < f64::EPSILON);
        registry.set_pool_state(0, 3, 4);
        assert_eq!(registry.utilization(), 0.0);
    }

    #[test]
    fn test_histogram_buckets() {
        let mut hist = Histogram::default();
        hist.observe(1.0);
        hist.observe(301.0);
        hist.observe(100_000.0);
        assert_eq!(hist.count, 3);
        assert_eq!(hist.buckets[0], 1);
        assert_eq!(hist.buckets[7], 1); // 300 < 301 <= 500
        assert_eq!(hist.buckets[DURATION_BUCKETS_MS.len()], 1);
    }

    #[test]
    fn test_render_prometheus() {
        let registry = MetricsRegistry::new();
        registry.record_query(
            &QueryMetrics::success(Duration::from_millis(2), 1),
            StatementKind::Select,
            "SELECT \"x\"",
        );
        registry.record_slow_query("SELECT 1");
        registry.set_pool_state(1, 0, 2);

        let text = registry.render_prometheus();
        assert!(text.contains("# TYPE warehouse_query_duration_ms histogram"));
        assert!(text.contains(
            "warehouse_query_duration_ms_count{type=\"select\",status=\"success\",source=\"SELECT \\\"x\\\"\"} 1"
        ));
        assert!(text.contains("warehouse_slow_queries_total{source=\"SELECT 1\"} 1"));
        assert!(text.contains("warehouse_pool_utilization 0.5"));
    }

    #[test]
    fn test_query_metrics_record() {
        let ok = QueryMetrics::success(Duration::from_millis(5), 10);
        assert!(ok.success);
        assert_eq!(ok.status(), "success");
        let err = QueryMetrics::failure(Duration::from_millis(5), "bad");
        assert_eq!(err.row_count, 0);
        assert_eq!(err.error.as_deref(), Some("bad"));
        assert_ne!(ok.query_id, err.query_id);
    }
}
