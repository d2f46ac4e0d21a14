//! The seam between the pool and the component that actually talks to the
//! warehouse.
//!
//! The pool never inspects driver state: it only connects, executes and
//! closes. Connection encryption and authentication negotiation are the
//! driver's business.

use crate::config::PoolConfig;
use crate::error::DriverError;
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use std::time::Duration;

/// Opens sessions against the remote engine.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Establish and initialize one session.
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn DriverSession>, DriverError>;
}

/// One live session. Used by at most one caller at a time.
#[async_trait]
pub trait DriverSession: Send {
    /// Run one statement with positional binds.
    ///
    /// The driver enforces `timeout` and reports an overrun as
    /// [`DriverError::statement_timeout`].
    async fn execute(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> Result<Vec<Row>, DriverError>;

    /// Close the session. Further calls to `execute` fail.
    async fn close(&mut self) -> Result<(), DriverError>;
}
