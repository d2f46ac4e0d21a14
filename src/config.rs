//! Configuration handling for the warehouse pool.
//!
//! This module provides configuration management via CLI arguments and environment variables.
//! [`PoolConfig`] is immutable once a pool is constructed and is validated at construction.

use crate::error::{DbError, DbResult};
use clap::{Args, Parser, ValueEnum};
use std::time::Duration;

pub const DEFAULT_SCHEMA: &str = "PUBLIC";
pub const DEFAULT_ENDPOINT: &str = "postgres://localhost:5432";

// Pool configuration defaults
pub const DEFAULT_POOL_SIZE: u32 = 5;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_SESSION_AGE_MS: u64 = 3_600_000;

/// Queries slower than this are counted and logged as slow.
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(300);

/// What happens to a healthy session when its lease is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReleasePolicy {
    /// Return the session to the idle set for the next lease.
    #[default]
    Recycle,
    /// Tear the session down on every release.
    Destroy,
}

impl std::fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recycle => write!(f, "recycle"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Session pool configuration.
#[derive(Clone, Args)]
pub struct PoolConfig {
    /// Warehouse account identifier
    #[arg(long, env = "WAREHOUSE_ACCOUNT", default_value = "")]
    pub account: String,

    /// Login user
    #[arg(long, env = "WAREHOUSE_USERNAME", default_value = "")]
    pub username: String,

    /// Login password (sensitive - not logged)
    #[arg(long, env = "WAREHOUSE_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Target database
    #[arg(long, env = "WAREHOUSE_DATABASE", default_value = "")]
    pub database: String,

    /// Compute warehouse that runs the queries
    #[arg(long, env = "WAREHOUSE_WAREHOUSE", default_value = "")]
    pub warehouse: String,

    /// Target schema
    #[arg(long, env = "WAREHOUSE_SCHEMA", default_value = DEFAULT_SCHEMA)]
    pub schema: String,

    /// Role assumed by every session
    #[arg(long, env = "WAREHOUSE_ROLE")]
    pub role: Option<String>,

    /// Maximum number of live sessions
    #[arg(long, env = "WAREHOUSE_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: u32,

    /// How long acquire waits for a session, in milliseconds
    #[arg(
        long,
        env = "WAREHOUSE_CONNECTION_TIMEOUT_MS",
        default_value_t = DEFAULT_CONNECTION_TIMEOUT_MS
    )]
    pub connection_timeout_ms: u64,

    /// Driver-side statement timeout, in milliseconds
    #[arg(
        long,
        env = "WAREHOUSE_QUERY_TIMEOUT_MS",
        default_value_t = DEFAULT_QUERY_TIMEOUT_MS
    )]
    pub query_timeout_ms: u64,

    /// Retry budget for callers that opt into retries
    #[arg(long, env = "WAREHOUSE_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Delay between retries, in milliseconds
    #[arg(
        long,
        env = "WAREHOUSE_RETRY_DELAY_MS",
        default_value_t = DEFAULT_RETRY_DELAY_MS
    )]
    pub retry_delay_ms: u64,

    /// Interval between health sweeps, in milliseconds
    #[arg(
        long,
        env = "WAREHOUSE_HEALTH_CHECK_INTERVAL_MS",
        default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL_MS
    )]
    pub health_check_interval_ms: u64,

    /// Sessions older than this are retired, in milliseconds (0 disables)
    #[arg(
        long,
        env = "WAREHOUSE_MAX_SESSION_AGE_MS",
        default_value_t = DEFAULT_MAX_SESSION_AGE_MS
    )]
    pub max_session_age_ms: u64,

    /// What to do with a healthy session on release
    #[arg(
        long,
        value_enum,
        env = "WAREHOUSE_RELEASE_POLICY",
        default_value = "recycle"
    )]
    pub release_policy: ReleasePolicy,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("account", &self.account)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("warehouse", &self.warehouse)
            .field("schema", &self.schema)
            .field("role", &self.role)
            .field("pool_size", &self.pool_size)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("health_check_interval_ms", &self.health_check_interval_ms)
            .field("max_session_age_ms", &self.max_session_age_ms)
            .field("release_policy", &self.release_policy)
            .finish()
    }
}

impl PoolConfig {
    /// Create a configuration with the required identity fields and defaults elsewhere.
    pub fn new(
        account: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
        warehouse: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            username: username.into(),
            password: password.into(),
            database: database.into(),
            warehouse: warehouse.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            role: None,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            max_session_age_ms: DEFAULT_MAX_SESSION_AGE_MS,
            release_policy: ReleasePolicy::default(),
        }
    }

    /// Validate the configuration. Called by the pool at construction.
    pub fn validate(&self) -> DbResult<()> {
        let required = [
            ("account", &self.account),
            ("username", &self.username),
            ("password", &self.password),
            ("database", &self.database),
            ("warehouse", &self.warehouse),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DbError::configuration(format!(
                    "Missing required configuration: {}",
                    field
                )));
            }
        }

        if self.pool_size == 0 {
            return Err(DbError::configuration(
                "pool_size must be greater than 0",
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(DbError::configuration(
                "connection_timeout_ms must be greater than 0",
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(DbError::configuration(
                "query_timeout_ms must be greater than 0",
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(DbError::configuration(
                "health_check_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Get the acquire timeout as a Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Get the statement timeout as a Duration.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Get the retry delay as a Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Get the health sweep interval as a Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Maximum session age, or `None` when age-based retirement is disabled.
    pub fn max_session_age(&self) -> Option<Duration> {
        (self.max_session_age_ms > 0).then(|| Duration::from_millis(self.max_session_age_ms))
    }
}

/// Configuration for the warehouse-pool binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "warehouse-pool",
    about = "Pooled, instrumented SQL sessions against an analytic warehouse",
    version,
    author
)]
pub struct Config {
    #[command(flatten)]
    pub pool: PoolConfig,

    /// Endpoint URL of the warehouse (postgres://host:port or sqlite:path)
    #[arg(long, env = "WAREHOUSE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Statements to run once the pool is up. When empty, the pool serves
    /// until interrupted.
    #[arg(short = 'e', long = "execute", value_name = "SQL")]
    pub statements: Vec<String>,

    /// Print the metrics exposition before exiting
    #[arg(long, env = "WAREHOUSE_PRINT_METRICS")]
    pub print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WAREHOUSE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "WAREHOUSE_JSON_LOGS")]
    pub json_logs: bool,
}
