//! Transactions and batches over a single leased session.
//!
//! Both hold one lease for the whole operation so every statement runs on the
//! same session, one at a time.
//!
//! A transaction issues `BEGIN`, runs the caller's operation, then exactly
//! one of `COMMIT` (operation succeeded) or `ROLLBACK` (operation returned an
//! error or panicked). The lease is given back exactly once afterwards; a
//! session whose `COMMIT` or `ROLLBACK` failed is discarded rather than
//! recycled.

use super::executor::QueryExecutor;
use super::pool::Lease;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use tracing::{debug, info, warn};

/// An open transaction, handed to the operation passed to
/// [`QueryExecutor::execute_transaction`].
pub struct Transaction {
    executor: QueryExecutor,
    lease: Lease,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.executor.execute_on(&mut self.lease, sql, params).await
    }

    pub fn session_id(&self) -> u64 {
        self.lease.session_id()
    }

    /// The underlying lease, for callers that pass it to
    /// [`QueryExecutor::execute`] directly.
    pub fn lease(&mut self) -> &mut Lease {
        &mut self.lease
    }
}

impl QueryExecutor {
    /// Run `op` inside `BEGIN` / `COMMIT`, rolling back on error or panic.
    ///
    /// ```ignore
    /// let id = executor
    ///     .execute_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.execute("INSERT INTO scores (player, score) VALUES (?, ?)", &params)
    ///                 .await?;
    ///             let rows = tx.execute("SELECT last_insert_rowid() AS id", &[]).await?;
    ///             Ok(rows[0]["id"].clone())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// Errors from the operation come back wrapped in
    /// [`DbError::Transaction`]. A panic in the operation is re-raised after
    /// the rollback.
    pub async fn execute_transaction<T, F>(&self, op: F) -> DbResult<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut lease = self.pool().acquire().await?;
        if let Err(e) = self.execute_on(&mut lease, "BEGIN", &[]).await {
            self.pool().discard(lease).await;
            return Err(DbError::transaction("Failed to begin transaction", e));
        }
        debug!(session_id = lease.session_id(), "Transaction started");

        let mut tx = Transaction {
            executor: self.clone(),
            lease,
        };
        let outcome = {
            let tx_ref = &mut tx;
            match std::panic::catch_unwind(AssertUnwindSafe(move || op(tx_ref))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            }
        };
        let Transaction { mut lease, .. } = tx;

        match outcome {
            Ok(Ok(value)) => match self.execute_on(&mut lease, "COMMIT", &[]).await {
                Ok(_) => {
                    info!(session_id = lease.session_id(), "Transaction committed");
                    self.pool().release(lease).await;
                    Ok(value)
                }
                Err(e) => {
                    self.pool().discard(lease).await;
                    Err(DbError::transaction("Commit failed", e))
                }
            },
            Ok(Err(e)) => {
                self.rollback(lease).await;
                Err(DbError::transaction("Transaction rolled back", e))
            }
            Err(panic) => {
                warn!("Transaction operation panicked, rolling back");
                self.rollback(lease).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback(&self, mut lease: Lease) {
        match self.execute_on(&mut lease, "ROLLBACK", &[]).await {
            Ok(_) => {
                info!(session_id = lease.session_id(), "Transaction rolled back");
                self.pool().release(lease).await;
            }
            Err(e) => {
                warn!(
                    session_id = lease.session_id(),
                    error = %e,
                    "Rollback failed, discarding session"
                );
                self.pool().discard(lease).await;
            }
        }
    }

    /// Run `sql` once per parameter set, sequentially on one session.
    ///
    /// Returns the rows of each run in order. The first failure stops the
    /// batch; the session is discarded and the error returned.
    pub async fn execute_batch(
        &self,
        sql: &str,
        param_sets: &[Vec<QueryParam>],
    ) -> DbResult<Vec<Vec<Row>>> {
        let mut lease = self.pool().acquire().await?;
        let mut results = Vec::with_capacity(param_sets.len());

        for (index, params) in param_sets.iter().enumerate() {
            match self.execute_on(&mut lease, sql, params).await {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    warn!(
                        index,
                        completed = results.len(),
                        total = param_sets.len(),
                        "Batch stopped on error"
                    );
                    self.pool().discard(lease).await;
                    return Err(e);
                }
            }
        }

        debug!(statements = results.len(), "Batch complete");
        self.pool().release(lease).await;
        Ok(results)
    }
}
