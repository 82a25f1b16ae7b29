//! Pipeline and chain run identifiers.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Generates `run-<n>` and `chain-<n>` identifiers.
///
/// `n` is a millisecond timestamp bumped past the previous value, so ids are
/// strictly increasing within a process and do not repeat across restarts.
#[derive(Debug, Default)]
pub struct RunIdGenerator {
    last: AtomicI64,
}

impl RunIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_value(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    pub fn pipeline_run_id(&self) -> String {
        format!("run-{}", self.next_value())
    }

    pub fn chain_run_id(&self) -> String {
        format!("chain-{}", self.next_value())
    }
}
