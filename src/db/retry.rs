//! Opt-in retries for callers that want them.
//!
//! [`QueryExecutor::execute`](super::QueryExecutor::execute) never retries.
//! Callers that do want retries wrap an operation with [`RetryPolicy::run`];
//! only errors reporting
//! [`DbError::is_retryable`](crate::error::DbError::is_retryable) are
//! retried.

use crate::config::PoolConfig;
use crate::error::DbResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    /// Run `op`, retrying retryable failures up to `max_retries` times.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        code = %e.code(),
                        error = %e,
                        "Retrying after retryable error"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
