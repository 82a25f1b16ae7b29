//! Periodic repair of stranded job executions.

use crate::config::SchedulerConfig;
use crate::runtime::DependencyRuntime;
use chrono::{DateTime, Utc};
use ciwi_core::Result;
use ciwi_core::ports::JobExecutionRepository;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{error, info, warn};

pub const TIMEOUT_MARKER: &str = "[control] job timed out while running (server maintenance)";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub requeued: u64,
    pub timed_out: usize,
}

/// Requeues stale leases and fails runs past their timeout.
pub struct MaintenanceService {
    jobs: Arc<dyn JobExecutionRepository>,
    runtime: Arc<DependencyRuntime>,
    config: SchedulerConfig,
}

impl MaintenanceService {
    pub fn new(
        jobs: Arc<dyn JobExecutionRepository>,
        runtime: Arc<DependencyRuntime>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            runtime,
            config,
        }
    }

    /// One maintenance pass at `now`. Running it twice at the same instant
    /// changes nothing the second time.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let stale_after = chrono::Duration::from_std(self.config.stale_lease_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(45));
        let grace = chrono::Duration::from_std(self.config.running_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(15));

        let requeued = self.jobs.requeue_stale_leased(now, stale_after).await?;
        if requeued > 0 {
            warn!(requeued, "requeued stale leased job executions");
        }

        let timed_out = self
            .jobs
            .fail_timed_out_running(now, grace, TIMEOUT_MARKER)
            .await?;
        if !timed_out.is_empty() {
            warn!(
                failed = timed_out.len(),
                "failed job executions that timed out while running"
            );
        }
        for job in &timed_out {
            self.runtime.on_job_updated(job).await?;
        }

        Ok(MaintenanceReport {
            requeued,
            timed_out: timed_out.len(),
        })
    }

    /// Run a pass immediately, then one per tick until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let tick = self.config.maintenance_tick;
        info!(tick_secs = tick.as_secs(), "starting maintenance loop");

        if let Err(e) = self.run_pass(Utc::now()).await {
            error!(error = %e, "maintenance pass failed");
        }

        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_pass(Utc::now()).await {
                        error!(error = %e, "maintenance pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("maintenance loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
