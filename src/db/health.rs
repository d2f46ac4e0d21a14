//! Periodic health sweeps over idle sessions.
//!
//! A sweep probes each idle session with `SELECT 1`, one at a time, and
//! destroys the ones that fail or have outlived the maximum session age.
//! Nothing is repaired and nothing is replenished: the pool opens
//! replacements lazily on the next acquire. Leased sessions are never
//! probed, since a probe would be a second in-flight statement on the
//! session.
//!
//! The background task holds only a `Weak` reference to the pool and exits
//! once the pool is dropped or closed.

use super::pool::{PoolShared, SessionPool};
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that received a probe
    pub probed: usize,
    /// Sessions destroyed (failed probe or too old)
    pub evicted: usize,
    /// The sweep came too soon after the previous one and did nothing
    pub skipped: bool,
}

/// Health monitor for one pool.
#[derive(Debug)]
pub struct HealthMonitor {
    pool: Weak<PoolShared>,
    interval: Duration,
    last_sweep: Option<Instant>,
}

impl HealthMonitor {
    pub fn new(pool: &SessionPool) -> Self {
        Self {
            pool: pool.downgrade(),
            interval: pool.config().health_check_interval(),
            last_sweep: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a sweep now, unless the previous one was less than an interval ago.
    pub async fn sweep(&mut self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    async fn sweep_at(&mut self, now: Instant) -> SweepReport {
        if let Some(previous) = self.last_sweep {
            if now.saturating_duration_since(previous) < self.interval {
                debug!("Health sweep requested before interval elapsed, skipping");
                return SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                };
            }
        }
        self.last_sweep = Some(now);

        let Some(shared) = self.pool.upgrade() else {
            return SweepReport::default();
        };
        let pool = SessionPool::from_shared(shared);
        let metrics = pool.metrics();

        let mut report = SweepReport::default();
        // Only the session under probe is out of the idle set, so callers can
        // still lease the others while a probe hangs.
        for id in pool.idle_ids() {
            let Some((mut session, permit)) = pool.checkout(id) else {
                continue;
            };
            if pool.is_expired(&session) {
                pool.evict(session, permit, "max session age").await;
                report.evicted += 1;
                continue;
            }

            report.probed += 1;
            match pool.probe(&mut session).await {
                Ok(()) => {
                    metrics.record_health_check(true);
                    pool.checkin(session, permit).await;
                }
                Err(e) => {
                    metrics.record_health_check(false);
                    warn!(
                        session_id = session.id,
                        error = %e,
                        "Health check failed, evicting session"
                    );
                    pool.evict(session, permit, "health check failed").await;
                    report.evicted += 1;
                }
            }
        }

        if report.evicted > 0 {
            info!(
                probed = report.probed,
                evicted = report.evicted,
                "Health sweep evicted sessions"
            );
        } else {
            debug!(probed = report.probed, "Health sweep complete");
        }
        report
    }

    /// Sweep on a fixed interval until the pool is dropped or closed.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; a fresh pool has nothing to sweep.
            ticker.tick().await;

            loop {
                let tick = ticker.tick().await;

                let alive = self
                    .pool
                    .upgrade()
                    .is_some_and(|shared| !SessionPool::from_shared(shared).is_closed());
                if !alive {
                    info!("Session pool gone, health monitor exiting");
                    return;
                }

                self.sweep_at(tick).await;
            }
        })
    }
}
