//! [`Driver`] implementation on sqlx single connections.
//!
//! Each pooled session is one dedicated `PgConnection` or `SqliteConnection`;
//! sqlx's own pool is not used, the session pool owns the lifecycle. The
//! Postgres backend serves PostgreSQL-wire warehouse endpoints; SQLite backs
//! local development and the integration tests.

use super::driver::{Driver, DriverSession};
use super::params::{bind_postgres_param, bind_sqlite_param};
use super::types::RowToJson;
use crate::config::PoolConfig;
use crate::error::{DriverError, ErrorCode};
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Wire backend selected from the endpoint URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Detect the backend from an endpoint URL.
    pub fn from_endpoint(endpoint: &str) -> Result<Self, DriverError> {
        let scheme = endpoint
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(DriverError::new(format!(
                "Unsupported endpoint scheme '{}': expected postgres:// or sqlite:",
                scheme
            ))
            .with_code(ErrorCode::ConnectionError.as_str())),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Opens sqlx connections to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    backend: Backend,
    endpoint: String,
}

impl SqlxDriver {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DriverError> {
        let endpoint = endpoint.into();
        let backend = Backend::from_endpoint(&endpoint)?;
        Ok(Self { backend, endpoint })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Build the Postgres connection URL: credentials and database from the
    /// pool configuration, warehouse as the application name.
    fn postgres_url(&self, config: &PoolConfig) -> Result<String, DriverError> {
        let mut url = url::Url::parse(&self.endpoint).map_err(|e| {
            DriverError::new(format!("Invalid endpoint URL: {}", e))
                .with_code(ErrorCode::ConnectionError.as_str())
        })?;

        let invalid = |what: &str| {
            DriverError::new(format!("Endpoint URL cannot carry a {}", what))
                .with_code(ErrorCode::ConnectionError.as_str())
        };
        url.set_username(&config.username)
            .map_err(|_| invalid("username"))?;
        url.set_password(Some(&config.password))
            .map_err(|_| invalid("password"))?;
        url.set_path(&format!("/{}", config.database));
        url.query_pairs_mut()
            .append_pair("application_name", &config.warehouse);

        Ok(url.to_string())
    }

    async fn connect_postgres(&self, config: &PoolConfig) -> Result<SqlxConnection, DriverError> {
        let url = self.postgres_url(config)?;
        let options = PgConnectOptions::from_str(&url)?;
        let mut conn = options.connect().await?;

        let schema = simple_identifier(&config.schema, "schema")?;
        let set_schema = format!("SET search_path TO {}", schema);
        sqlx::Executor::execute(&mut conn, set_schema.as_str()).await?;
        if let Some(role) = &config.role {
            let role = simple_identifier(role, "role")?;
            let set_role = format!("SET ROLE {}", role);
            sqlx::Executor::execute(&mut conn, set_role.as_str()).await?;
        }

        Ok(SqlxConnection::Postgres(conn))
    }

    async fn connect_sqlite(&self, config: &PoolConfig) -> Result<SqlxConnection, DriverError> {
        let options = SqliteConnectOptions::from_str(&self.endpoint)?.create_if_missing(true);
        let conn = options.connect().await?;
        if config.role.is_some() {
            debug!("SQLite has no roles; ignoring configured role");
        }
        Ok(SqlxConnection::Sqlite(conn))
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn DriverSession>, DriverError> {
        let conn = match self.backend {
            Backend::Postgres => self.connect_postgres(config).await?,
            Backend::Sqlite => self.connect_sqlite(config).await?,
        };
        debug!(
            backend = %self.backend,
            account = %config.account,
            warehouse = %config.warehouse,
            "Opened driver session"
        );
        Ok(Box::new(SqlxSession { conn: Some(conn) }))
    }
}

/// Accept only plain identifiers for statements that cannot take binds.
fn simple_identifier<'a>(value: &'a str, what: &str) -> Result<&'a str, DriverError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !value.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(value)
    } else {
        Err(DriverError::new(format!("Invalid {} identifier: '{}'", what, value))
            .with_code(ErrorCode::ConnectionError.as_str()))
    }
}

enum SqlxConnection {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

/// A pooled sqlx connection.
pub struct SqlxSession {
    conn: Option<SqlxConnection>,
}

impl SqlxSession {
    async fn fetch(
        conn: &mut SqlxConnection,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Vec<Row>, DriverError> {
        match conn {
            SqlxConnection::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_postgres_param(query, param);
                }
                let rows = query.fetch_all(&mut *conn).await?;
                Ok(rows.iter().map(RowToJson::to_json_row).collect())
            }
            SqlxConnection::Sqlite(conn) => {
                let mut query = sqlx::query(sql);
                for param in params {
                    query = bind_sqlite_param(query, param);
                }
                let rows = query.fetch_all(&mut *conn).await?;
                Ok(rows.iter().map(RowToJson::to_json_row).collect())
            }
        }
    }
}

#[async_trait]
impl DriverSession for SqlxSession {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> Result<Vec<Row>, DriverError> {
        let conn = self.conn.as_mut().ok_or_else(|| {
            DriverError::new("Session is closed").with_code(ErrorCode::ConnectionError.as_str())
        })?;

        match tokio::time::timeout(timeout, Self::fetch(conn, sql, params)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::statement_timeout(timeout.as_millis() as u64)),
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        match self.conn.take() {
            Some(SqlxConnection::Postgres(conn)) => conn.close().await?,
            Some(SqlxConnection::Sqlite(conn)) => conn.close().await?,
            None => {}
        }
        Ok(())
    }
}
