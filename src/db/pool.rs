//! Bounded session pool.
//!
//! The pool hands out [`Lease`]s on live driver sessions. Capacity is a fair
//! semaphore with one permit per configured session: waiters are served in
//! FIFO order and a lease holds its permit until release. Sessions are created
//! lazily, only when no idle session is available.
//!
//! Bookkeeping lives behind a synchronous mutex that is never held across an
//! await, so the find-idle/mark-busy step is a single uninterrupted critical
//! section.
//!
//! # Release
//!
//! [`SessionPool::release`] follows the configured [`ReleasePolicy`]: a
//! healthy session is either returned to the idle set or torn down.
//! [`SessionPool::discard`] always tears the session down. A lease dropped
//! without either is destroyed from its `Drop` impl, which logs a warning.

use super::driver::{Driver, DriverSession};
use crate::config::{PoolConfig, ReleasePolicy};
use crate::error::{DbError, DbResult, DriverError, ErrorCode};
use crate::metrics::MetricsRegistry;
use crate::models::{QueryParam, Row};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStatus {
    /// Sessions waiting in the idle set
    pub idle: u32,
    /// Sessions currently leased
    pub busy: u32,
    /// All live sessions, including ones being connected or probed
    pub total: u32,
    /// Configured maximum
    pub max: u32,
    /// busy / max
    pub utilization: f64,
}

/// A live session owned by the pool.
pub(crate) struct PooledSession {
    pub(crate) id: u64,
    created_at: Instant,
    conn: Box<dyn DriverSession>,
}

impl PooledSession {
    fn is_expired(&self, max_age: Option<Duration>) -> bool {
        max_age.is_some_and(|max| self.created_at.elapsed() >= max)
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledSession>,
    leased: HashSet<u64>,
    /// Every live session: idle, leased, connecting or being probed.
    total: u32,
    closed: bool,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    metrics: Arc<MetricsRegistry>,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_gauges(&self, state: &PoolState) {
        self.metrics.set_pool_state(
            state.leased.len() as u32,
            state.idle.len() as u32,
            self.config.pool_size,
        );
    }

    /// Remove a session from bookkeeping. Returns false if it was not leased.
    fn forget_leased(&self, state: &mut PoolState, id: u64) -> bool {
        let was_leased = state.leased.remove(&id);
        if !was_leased {
            warn!(session_id = id, "Released a session the pool did not have on lease");
        }
        was_leased
    }

    fn forget_total(state: &mut PoolState, id: u64) {
        if state.total == 0 {
            warn!(session_id = id, "Session count already zero, ignoring decrement");
        } else {
            state.total -= 1;
        }
    }
}

/// Close a driver session that has already been removed from bookkeeping.
async fn close_session(metrics: Arc<MetricsRegistry>, mut session: PooledSession, reason: &str) {
    match session.conn.close().await {
        Ok(()) => debug!(session_id = session.id, reason, "Session destroyed"),
        Err(e) => {
            let code = e.code_or(ErrorCode::ConnectionError);
            warn!(
                session_id = session.id,
                reason,
                code = %code,
                error = %e,
                "Failed to close session cleanly"
            );
            metrics.record_connection_error(&code);
        }
    }
    metrics.session_destroyed();
}

/// Undo a slot reservation if connecting is abandoned.
struct Reservation<'a> {
    shared: &'a PoolShared,
    id: u64,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            PoolShared::forget_total(&mut state, self.id);
        }
    }
}

/// Bounded pool of driver sessions.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create a pool. The configuration is validated; no session is opened.
    pub fn new(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        metrics: Arc<MetricsRegistry>,
    ) -> DbResult<Self> {
        config.validate()?;
        let permits = config.pool_size as usize;
        metrics.set_pool_state(0, 0, config.pool_size);
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                driver,
                metrics,
                semaphore: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<PoolShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Lease a session, waiting up to the connection timeout for capacity.
    ///
    /// Returns an idle session when one exists, otherwise opens a new one if
    /// the pool is below its maximum, otherwise waits in FIFO order for a
    /// release.
    pub async fn acquire(&self) -> DbResult<Lease> {
        let timeout = self.shared.config.connection_timeout();
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => {
                let status = self.status();
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    busy = status.busy,
                    max = status.max,
                    "Timed out waiting for a session"
                );
                Err(DbError::connection_timeout(
                    timeout.as_millis() as u64,
                    self.shared.config.pool_size,
                ))
            }
        }
    }

    async fn acquire_inner(&self) -> DbResult<Lease> {
        let shared = &self.shared;
        if shared.lock().closed {
            return Err(DbError::PoolClosed);
        }

        let permit = Arc::clone(&shared.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DbError::PoolClosed)?;
        let max_age = shared.config.max_session_age();

        loop {
            let popped = {
                let mut state = shared.lock();
                if state.closed {
                    return Err(DbError::PoolClosed);
                }
                match state.idle.pop_front() {
                    Some(session) if session.is_expired(max_age) => {
                        PoolShared::forget_total(&mut state, session.id);
                        shared.publish_gauges(&state);
                        Some(Err(session))
                    }
                    Some(session) => {
                        state.leased.insert(session.id);
                        shared.publish_gauges(&state);
                        Some(Ok(session))
                    }
                    None => {
                        state.total += 1;
                        None
                    }
                }
            };

            match popped {
                Some(Ok(session)) => {
                    debug!(session_id = session.id, "Leased idle session");
                    return Ok(Lease::new(session, permit, Arc::clone(shared)));
                }
                Some(Err(expired)) => {
                    close_session(shared.metrics(), expired, "max session age").await;
                }
                None => break,
            }
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reservation = Reservation {
            shared,
            id,
            armed: true,
        };

        match shared.driver.connect(&shared.config).await {
            Ok(conn) => {
                reservation.armed = false;
                let session = PooledSession {
                    id,
                    created_at: Instant::now(),
                    conn,
                };
                {
                    let mut state = shared.lock();
                    state.leased.insert(id);
                    shared.publish_gauges(&state);
                }
                shared.metrics.session_created();
                info!(session_id = id, "Opened new session");
                Ok(Lease::new(session, permit, Arc::clone(shared)))
            }
            Err(e) => {
                drop(reservation);
                let err = DbError::from_connect(&e);
                shared.metrics.record_connection_error(&err.code());
                warn!(code = %err.code(), error = %e, "Failed to open session");
                Err(err)
            }
        }
    }

    /// Return a lease. Healthy sessions are recycled or destroyed per the
    /// release policy; broken, interrupted or aged sessions are destroyed.
    pub async fn release(&self, lease: Lease) {
        self.finish(lease, false).await;
    }

    /// Return a lease and always destroy its session.
    pub async fn discard(&self, lease: Lease) {
        self.finish(lease, true).await;
    }

    async fn finish(&self, mut lease: Lease, force_destroy: bool) {
        let Some(session) = lease.session.take() else {
            return;
        };
        let permit = lease.permit.take();
        let shared = &lease.pool;

        let recycle = !force_destroy
            && !lease.broken
            && !lease.executing
            && shared.config.release_policy == ReleasePolicy::Recycle
            && !session.is_expired(shared.config.max_session_age());

        let doomed = {
            let mut state = shared.lock();
            shared.forget_leased(&mut state, session.id);
            let doomed = if recycle && !state.closed {
                state.idle.push_back(session);
                None
            } else {
                PoolShared::forget_total(&mut state, session.id);
                Some(session)
            };
            shared.publish_gauges(&state);
            doomed
        };
        // The idle push happens before the permit returns, so the next
        // waiter finds the session.
        drop(permit);

        if let Some(session) = doomed {
            let reason = if lease.broken || force_destroy {
                "discarded"
            } else {
                "released"
            };
            close_session(shared.metrics(), session, reason).await;
        }
    }

    /// Destroy every idle session and refuse further acquires.
    ///
    /// Leases still out are destroyed when they come back.
    pub async fn cleanup(&self) {
        let shared = &self.shared;
        let drained: Vec<PooledSession> = {
            let mut state = shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            for session in &drained {
                PoolShared::forget_total(&mut state, session.id);
            }
            shared.publish_gauges(&state);
            drained
        };
        shared.semaphore.close();

        let count = drained.len();
        for session in drained {
            close_session(shared.metrics(), session, "pool cleanup").await;
        }
        info!(destroyed = count, "Session pool closed");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        let busy = state.leased.len() as u32;
        let max = self.shared.config.pool_size;
        PoolStatus {
            idle: state.idle.len() as u32,
            busy,
            total: state.total,
            max,
            utilization: if max == 0 {
                0.0
            } else {
                f64::from(busy) / f64::from(max)
            },
        }
    }

    /// Ids of the sessions currently idle, oldest first.
    pub(crate) fn idle_ids(&self) -> Vec<u64> {
        self.shared.lock().idle.iter().map(|s| s.id).collect()
    }

    /// Take one idle session out for probing, paired with a capacity permit
    /// so the pool cannot open a replacement meanwhile. Returns `None` if the
    /// session has been leased since, or if no permit is free.
    pub(crate) fn checkout(&self, id: u64) -> Option<(PooledSession, OwnedSemaphorePermit)> {
        let mut state = self.shared.lock();
        let pos = state.idle.iter().position(|s| s.id == id)?;
        let permit = Arc::clone(&self.shared.semaphore).try_acquire_owned().ok()?;
        let session = state.idle.remove(pos)?;
        self.shared.publish_gauges(&state);
        Some((session, permit))
    }

    /// Return a probed session to the idle set.
    pub(crate) async fn checkin(&self, session: PooledSession, permit: OwnedSemaphorePermit) {
        let doomed = {
            let mut state = self.shared.lock();
            let doomed = if state.closed {
                PoolShared::forget_total(&mut state, session.id);
                Some(session)
            } else {
                state.idle.push_back(session);
                None
            };
            self.shared.publish_gauges(&state);
            doomed
        };
        drop(permit);
        if let Some(session) = doomed {
            close_session(self.shared.metrics(), session, "pool cleanup").await;
        }
    }

    /// Destroy a session taken out by [`checkout`](Self::checkout).
    pub(crate) async fn evict(
        &self,
        session: PooledSession,
        permit: OwnedSemaphorePermit,
        reason: &str,
    ) {
        {
            let mut state = self.shared.lock();
            PoolShared::forget_total(&mut state, session.id);
            self.shared.publish_gauges(&state);
        }
        drop(permit);
        close_session(self.shared.metrics(), session, reason).await;
    }

    pub(crate) fn is_expired(&self, session: &PooledSession) -> bool {
        session.is_expired(self.shared.config.max_session_age())
    }

    pub(crate) async fn probe(&self, session: &mut PooledSession) -> Result<(), DriverError> {
        session
            .conn
            .execute("SELECT 1", &[], self.shared.config.query_timeout())
            .await
            .map(|_| ())
    }
}

impl PoolShared {
    fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }
}

/// A caller's temporary right to use one pooled session.
///
/// Hand it back with [`SessionPool::release`] or [`SessionPool::discard`].
/// Dropping it instead destroys the session in a background task.
pub struct Lease {
    session: Option<PooledSession>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolShared>,
    broken: bool,
    executing: bool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("session_id", &self.session.as_ref().map(|s| s.id))
            .field("broken", &self.broken)
            .field("executing", &self.executing)
            .finish()
    }
}

impl Lease {
    fn new(session: PooledSession, permit: OwnedSemaphorePermit, pool: Arc<PoolShared>) -> Self {
        Self {
            session: Some(session),
            permit: Some(permit),
            pool,
            broken: false,
            executing: false,
        }
    }

    /// Pool-assigned session identity.
    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// Whether a statement is in flight on this session.
    pub fn is_executing(&self) -> bool {
        self.executing
    }

    /// Mark the session unusable; it is destroyed on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Run one statement on the leased session. The busy flag is set for the
    /// duration of the call and stays set if the call is cancelled.
    pub(crate) async fn run(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> Result<Vec<Row>, DriverError> {
        let session = self.session.as_mut().ok_or_else(|| {
            DriverError::new("Lease has already been returned")
                .with_code(ErrorCode::ConnectionError.as_str())
        })?;
        self.executing = true;
        let result = session.conn.execute(sql, params, timeout).await;
        self.executing = false;
        result
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let permit = self.permit.take();
        {
            let mut state = self.pool.lock();
            self.pool.forget_leased(&mut state, session.id);
            PoolShared::forget_total(&mut state, session.id);
            self.pool.publish_gauges(&state);
        }
        drop(permit);

        warn!(
            session_id = session.id,
            executing = self.executing,
            "Lease dropped without release - destroying session"
        );
        let metrics = self.pool.metrics();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(close_session(metrics, session, "lease dropped"));
            }
            Err(_) => metrics.session_destroyed(),
        }
    }
}
