//! Scheduler tunables.

use std::time::Duration;

/// Timing and policy knobs shared by the scheduler services.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between maintenance passes.
    pub maintenance_tick: Duration,
    /// A leased execution whose lease is older than this is requeued.
    pub stale_lease_after: Duration,
    /// Extra time a running execution gets past its own timeout.
    pub running_grace: Duration,
    pub adhoc_default_timeout_secs: u64,
    pub adhoc_max_timeout_secs: u64,
    pub update_warmup_base: Duration,
    pub update_warmup_jitter: Duration,
    pub update_backoff_base: Duration,
    pub update_backoff_max: Duration,
    /// Repository for which a selection's source-ref override applies.
    /// Empty means any pipeline that declares a source repo.
    pub source_ref_override_repo: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_tick: Duration::from_secs(10),
            stale_lease_after: Duration::from_secs(45),
            running_grace: Duration::from_secs(15),
            adhoc_default_timeout_secs: 600,
            adhoc_max_timeout_secs: 3600,
            update_warmup_base: Duration::from_secs(10),
            update_warmup_jitter: Duration::from_secs(20),
            update_backoff_base: Duration::from_secs(30),
            update_backoff_max: Duration::from_secs(15 * 60),
            source_ref_override_repo: String::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_source_ref_override_repo(mut self, repo: impl Into<String>) -> Self {
        self.source_ref_override_repo = repo.into();
        self
    }
}
