//! Scriptable in-memory driver for unit tests.

use super::driver::{Driver, DriverSession};
use crate::config::PoolConfig;
use crate::error::DriverError;
use crate::models::{QueryParam, Row};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeState {
    connects: u64,
    closed: u64,
    open: u64,
    peak_open: u64,
    executing: u64,
    peak_executing: u64,
    failing_connects: u32,
    connect_latency: Duration,
    /// (sql substring, latency)
    latencies: Vec<(String, Duration)>,
    /// (sql substring, error)
    failures: Vec<(String, DriverError)>,
    unhealthy: Vec<u64>,
    /// (driver session number, sql) in execution order
    log: Vec<(u64, String)>,
}

/// Driver double. Clones share state, so a test keeps one handle and gives
/// another to the pool.
#[derive(Clone, Default)]
pub(crate) struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn with_connect_latency(self, latency: Duration) -> Self {
        self.lock().connect_latency = latency;
        self
    }

    /// Statements containing `pattern` take `latency` to run.
    pub(crate) fn delay_on(&self, pattern: &str, latency: Duration) {
        self.lock().latencies.push((pattern.to_string(), latency));
    }

    /// Statements containing `pattern` fail with `error`.
    pub(crate) fn fail_on(&self, pattern: &str, error: DriverError) {
        self.lock().failures.push((pattern.to_string(), error));
    }

    pub(crate) fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// The nth opened session (1-based) fails every `SELECT 1` probe.
    pub(crate) fn mark_unhealthy(&self, session_number: u64) {
        self.lock().unhealthy.push(session_number);
    }

    pub(crate) fn connects(&self) -> u64 {
        self.lock().connects
    }

    pub(crate) fn closed(&self) -> u64 {
        self.lock().closed
    }

    pub(crate) fn peak_open(&self) -> u64 {
        self.lock().peak_open
    }

    pub(crate) fn peak_executing(&self) -> u64 {
        self.lock().peak_executing
    }

    /// Executed statements, in order.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.lock().log.iter().map(|(_, sql)| sql.clone()).collect()
    }

    /// Executed statements with the session number that ran them.
    pub(crate) fn log(&self) -> Vec<(u64, String)> {
        self.lock().log.clone()
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn connect(&self, _config: &PoolConfig) -> Result<Box<dyn DriverSession>, DriverError> {
        let latency = self.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DriverError::new("connection refused"));
        }
        state.connects += 1;
        state.open += 1;
        state.peak_open = state.peak_open.max(state.open);
        Ok(Box::new(FakeSession {
            number: state.connects,
            driver: self.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    number: u64,
    driver: FakeDriver,
    closed: bool,
}

#[async_trait]
impl DriverSession for FakeSession {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
        timeout: Duration,
    ) -> Result<Vec<Row>, DriverError> {
        if self.closed {
            return Err(DriverError::new("session closed"));
        }
        let (latency, failure) = {
            let mut state = self.driver.lock();
            state.log.push((self.number, sql.to_string()));
            state.executing += 1;
            state.peak_executing = state.peak_executing.max(state.executing);

            let latency = state
                .latencies
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, latency)| *latency);
            let failure = if sql == "SELECT 1" && state.unhealthy.contains(&self.number) {
                Some(DriverError::new("session unresponsive"))
            } else {
                state
                    .failures
                    .iter()
                    .find(|(pattern, _)| sql.contains(pattern.as_str()))
                    .map(|(_, err)| err.clone())
            };
            (latency, failure)
        };

        let outcome = match latency {
            Some(latency) if latency > timeout => {
                tokio::time::sleep(timeout).await;
                Err(DriverError::statement_timeout(timeout.as_millis() as u64))
            }
            Some(latency) => {
                tokio::time::sleep(latency).await;
                Ok(())
            }
            None => Ok(()),
        };
        self.driver.lock().executing -= 1;
        outcome?;

        if let Some(err) = failure {
            return Err(err);
        }
        if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            let mut row = Row::new();
            row.insert("session".to_string(), self.number.into());
            Ok(vec![row])
        } else {
            Ok(Vec::new())
        }
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed {
            self.closed = true;
            let mut state = self.driver.lock();
            state.closed += 1;
            state.open -= 1;
        }
        Ok(())
    }
}
