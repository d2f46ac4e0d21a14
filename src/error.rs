//! Error types for the warehouse pool.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver failures arrive as [`DriverError`] and are classified into [`DbError`]
//! variants by the pool and the executor, so callers can tell "no capacity"
//! apart from "broken driver" apart from "the statement failed".

use thiserror::Error;

/// Stable numeric error codes shared with the warehouse client.
///
/// Used as metric labels when the driver does not report its own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConnectionTimeout,
    StatementTimeout,
    ConnectionError,
    QueryError,
    AuthenticationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout => "1001",
            Self::StatementTimeout => "1002",
            Self::ConnectionError => "1003",
            Self::QueryError => "1004",
            Self::AuthenticationError => "1005",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by the underlying driver for a connect, execute or destroy call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Driver or server error code, e.g. "42P01" or "1004".
    pub code: Option<String>,
    /// SQLSTATE when the server reported one.
    pub sql_state: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    /// A statement that exceeded the driver-side query timeout.
    pub fn statement_timeout(timeout_ms: u64) -> Self {
        Self::new(format!("Statement exceeded {}ms", timeout_ms))
            .with_code(ErrorCode::StatementTimeout.as_str())
    }

    /// The code to report, falling back to the given classification.
    pub fn code_or(&self, fallback: ErrorCode) -> String {
        self.code
            .clone()
            .unwrap_or_else(|| fallback.as_str().to_string())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Timeout: no session became available within {waited_ms}ms (max pool size {max_size})")]
    ConnectionTimeout { waited_ms: u64, max_size: u32 },

    #[error("Connection failed: {message}")]
    Connection {
        message: String,
        code: String,
        suggestion: String,
    },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        code: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        /// SQL-prefix tag used to label metrics.
        origin: String,
        suggestion: String,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        cause: Box<DbError>,
    },

    #[error("Session pool is closed")]
    PoolClosed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an acquire timeout error.
    pub fn connection_timeout(waited_ms: u64, max_size: u32) -> Self {
        Self::ConnectionTimeout {
            waited_ms,
            max_size,
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(
        message: impl Into<String>,
        code: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            code: code.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Classify a driver error raised while establishing or destroying a session.
    pub fn from_connect(err: &DriverError) -> Self {
        let code = err.code_or(ErrorCode::ConnectionError);
        let suggestion = connection_suggestion(&err.message);
        Self::connection(err.message.clone(), code, suggestion)
    }

    /// Classify a driver error raised by a statement.
    pub fn from_statement(err: &DriverError, origin: impl Into<String>) -> Self {
        Self::Query {
            message: err.message.clone(),
            code: err.code_or(ErrorCode::QueryError),
            sql_state: err.sql_state.clone(),
            origin: origin.into(),
            suggestion: "Check the SQL syntax, bind parameters and referenced objects".to_string(),
        }
    }

    /// Wrap an error raised inside a transaction (after rollback).
    pub fn transaction(message: impl Into<String>, cause: DbError) -> Self {
        Self::Transaction {
            message: message.into(),
            cause: Box::new(cause),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Query { suggestion, .. } => Some(suggestion),
            Self::ConnectionTimeout { .. } => {
                Some("Increase the pool size or the connection timeout, or release sessions sooner")
            }
            Self::Transaction { cause, .. } => cause.suggestion(),
            _ => None,
        }
    }

    /// Error code used for metric labels and structured logs.
    pub fn code(&self) -> String {
        match self {
            Self::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout.as_str().to_string(),
            Self::Connection { code, .. } | Self::Query { code, .. } => code.clone(),
            Self::Transaction { cause, .. } => cause.code(),
            Self::PoolClosed => ErrorCode::ConnectionError.as_str().to_string(),
            Self::Configuration { .. } | Self::Internal { .. } => "internal".to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. }
        )
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(message: &str) -> String {
    let lower = message.to_lowercase();

    if lower.contains("connection refused") {
        return "Check that the warehouse endpoint is running and reachable".to_string();
    }
    if lower.contains("authentication") || lower.contains("password") {
        return "Verify the username and password".to_string();
    }
    if lower.contains("does not exist") || lower.contains("unknown database") {
        return "Check that the database and schema exist".to_string();
    }
    if lower.contains("tls") || lower.contains("ssl") {
        return "Check TLS/SSL configuration".to_string();
    }
    "Check the account identifier, endpoint and network connectivity".to_string()
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let mut out = DriverError::new(db_err.message());
                if let Some(code) = code {
                    if code.starts_with("28") {
                        out = out.with_code(ErrorCode::AuthenticationError.as_str());
                    } else {
                        out = out.with_code(code.clone());
                    }
                    out = out.with_sql_state(code);
                }
                out
            }
            sqlx::Error::Configuration(msg) => DriverError::new(msg.to_string())
                .with_code(ErrorCode::ConnectionError.as_str()),
            sqlx::Error::PoolTimedOut => DriverError::new("Driver pool acquire timed out")
                .with_code(ErrorCode::ConnectionTimeout.as_str()),
            sqlx::Error::PoolClosed => DriverError::new("Driver pool is closed")
                .with_code(ErrorCode::ConnectionError.as_str()),
            sqlx::Error::Io(io_err) => DriverError::new(format!("I/O error: {}", io_err))
                .with_code(ErrorCode::ConnectionError.as_str()),
            sqlx::Error::Tls(tls_err) => DriverError::new(format!("TLS error: {}", tls_err))
                .with_code(ErrorCode::ConnectionError.as_str()),
            sqlx::Error::Protocol(msg) => DriverError::new(format!("Protocol error: {}", msg))
                .with_code(ErrorCode::ConnectionError.as_str()),
            sqlx::Error::WorkerCrashed => DriverError::new("Database worker crashed")
                .with_code(ErrorCode::ConnectionError.as_str()),
            other => DriverError::new(other.to_string()).with_code(ErrorCode::QueryError.as_str()),
        }
    }
}

/// Result type alias for pool operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "1003", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));

        let err = DbError::connection_timeout(500, 2);
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::connection_timeout(10, 1).is_retryable());
        assert!(DbError::connection("err", "1003", "sugg").is_retryable());
        assert!(!DbError::configuration("missing account").is_retryable());
        let query = DbError::from_statement(&DriverError::new("syntax"), "select");
        assert!(!query.is_retryable());
    }

    #[test]
    fn test_statement_error_keeps_driver_code_and_state() {
        let driver = DriverError::new("relation does not exist")
            .with_code("42P01")
            .with_sql_state("42P01");
        let err = DbError::from_statement(&driver, "SELECT * FROM missing");
        assert_eq!(err.code(), "42P01");
        match err {
            DbError::Query {
                sql_state, origin, ..
            } => {
                assert_eq!(sql_state.as_deref(), Some("42P01"));
                assert_eq!(origin, "SELECT * FROM missing");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_codes_fall_back_to_classification() {
        let connect = DbError::from_connect(&DriverError::new("connection refused"));
        assert_eq!(connect.code(), "1003");
        assert!(connect.suggestion().unwrap().contains("reachable"));

        let query = DbError::from_statement(&DriverError::new("boom"), "x");
        assert_eq!(query.code(), "1004");

        assert_eq!(DbError::connection_timeout(1, 1).code(), "1001");
        assert_eq!(DriverError::statement_timeout(30).code.as_deref(), Some("1002"));
    }

    #[test]
    fn test_transaction_error_reports_cause() {
        let cause = DbError::from_statement(&DriverError::new("dup key").with_code("23505"), "x");
        let err = DbError::transaction("Transaction rolled back", cause);
        assert_eq!(err.code(), "23505");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_from_sqlx_error() {
        let err: DriverError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code.as_deref(), Some("1001"));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: DriverError = sqlx::Error::Io(io).into();
        assert_eq!(err.code.as_deref(), Some("1003"));

        let err: DriverError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code.as_deref(), Some("1004"));
    }
}
