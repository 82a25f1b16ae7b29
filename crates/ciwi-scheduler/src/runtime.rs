//! Chain and `needs` runtime.
//!
//! Runs after every status write. When an execution reaches a terminal
//! state its dependents are unblocked or cancelled. Cancellations are
//! themselves terminal transitions and are fed back into the same loop, so
//! a failure cascades through every transitive dependent.

use crate::dependency::{artifact_env, artifact_producers, encode_producers};
use ciwi_core::job::{JobExecution, JobExecutionStatus, JobStatusUpdate, SERVER_CHAIN_AGENT};
use ciwi_core::metadata::{self, FLAG_SET};
use ciwi_core::ports::{JobExecutionRepository, JobListFilter, QueuedPatch};
use ciwi_core::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Aggregate state of a group of executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    /// Some execution is not terminal yet, or the group is empty.
    Pending,
    Succeeded,
    Failed,
}

fn group_state<'a>(jobs: impl Iterator<Item = &'a JobExecution>) -> GroupState {
    let mut seen = false;
    let mut failed = false;
    for job in jobs {
        seen = true;
        match job.status {
            JobExecutionStatus::Succeeded => {}
            JobExecutionStatus::Failed => failed = true,
            _ => return GroupState::Pending,
        }
    }
    match (seen, failed) {
        (false, _) => GroupState::Pending,
        (true, true) => GroupState::Failed,
        (true, false) => GroupState::Succeeded,
    }
}

/// Unblocks or cancels dependents when executions finish.
pub struct DependencyRuntime {
    jobs: Arc<dyn JobExecutionRepository>,
}

impl DependencyRuntime {
    pub fn new(jobs: Arc<dyn JobExecutionRepository>) -> Self {
        Self { jobs }
    }

    /// React to a status write of `job`.
    pub async fn on_job_updated(&self, job: &JobExecution) -> Result<()> {
        let mut work = VecDeque::from([job.clone()]);
        while let Some(job) = work.pop_front() {
            if !job.status.is_terminal() {
                continue;
            }
            let mut finished = self.propagate_needs(&job).await?;
            finished.extend(self.propagate_chain(&job).await?);
            work.extend(finished);
        }
        Ok(())
    }

    async fn propagate_needs(&self, job: &JobExecution) -> Result<Vec<JobExecution>> {
        let (Some(run_id), Some(job_id)) = (
            job.meta(metadata::PIPELINE_RUN_ID),
            job.meta(metadata::PIPELINE_JOB_ID),
        ) else {
            return Ok(Vec::new());
        };

        let run = self
            .jobs
            .list(&JobListFilter::default().with_meta(metadata::PIPELINE_RUN_ID, run_id))
            .await?;
        let dependents: Vec<&JobExecution> = run
            .iter()
            .filter(|j| {
                j.status == JobExecutionStatus::Queued
                    && j.meta_flag(metadata::NEEDS_BLOCKED)
                    && metadata::list(&j.metadata, metadata::NEEDS_JOB_IDS)
                        .iter()
                        .any(|n| n == job_id)
            })
            .collect();

        let mut finished = Vec::new();
        for dependent in dependents {
            let needs = metadata::list(&dependent.metadata, metadata::NEEDS_JOB_IDS);
            let states: Vec<(&str, GroupState)> = needs
                .iter()
                .map(|need| {
                    let group = run
                        .iter()
                        .filter(|j| j.meta(metadata::PIPELINE_JOB_ID) == Some(need.as_str()));
                    (need.as_str(), group_state(group))
                })
                .collect();

            if let Some((failed_need, _)) = states.iter().find(|(_, s)| *s == GroupState::Failed) {
                let reason = format!("cancelled: required job {failed_need} failed");
                if let Some(cancelled) = self.cancel(dependent, false, &reason).await? {
                    finished.push(cancelled);
                }
            } else if states.iter().all(|(_, s)| *s == GroupState::Succeeded) {
                let patch = QueuedPatch {
                    remove_metadata: vec![metadata::NEEDS_BLOCKED.to_string()],
                    ..Default::default()
                };
                if self.jobs.patch_queued(dependent.id, &patch).await?.is_some() {
                    debug!(
                        job_execution_id = %dependent.id,
                        pipeline_run_id = %run_id,
                        "needs satisfied; job unblocked"
                    );
                }
            }
        }
        Ok(finished)
    }

    async fn propagate_chain(&self, job: &JobExecution) -> Result<Vec<JobExecution>> {
        let (Some(chain_run_id), Some(position), Some(pipeline_id)) = (
            job.meta(metadata::CHAIN_RUN_ID),
            job.chain_position(),
            job.meta(metadata::PIPELINE_ID),
        ) else {
            return Ok(Vec::new());
        };

        let members = self
            .jobs
            .list(&JobListFilter::default().with_meta(metadata::CHAIN_RUN_ID, chain_run_id))
            .await?;
        let pipeline_state = |id: &str| {
            group_state(
                members
                    .iter()
                    .filter(|j| j.meta(metadata::PIPELINE_ID) == Some(id)),
            )
        };

        let mut finished = Vec::new();
        match job.status {
            JobExecutionStatus::Failed => {
                let reason = format!("cancelled: upstream pipeline {pipeline_id} failed");
                let later = members.iter().filter(|j| {
                    j.status == JobExecutionStatus::Queued
                        && j.chain_position().is_some_and(|p| p > position)
                });
                for sibling in later {
                    if let Some(cancelled) = self.cancel(sibling, true, &reason).await? {
                        finished.push(cancelled);
                    }
                }
                if !finished.is_empty() {
                    info!(
                        chain_run_id = %chain_run_id,
                        pipeline_id = %pipeline_id,
                        cancelled = finished.len(),
                        "chain run cancelled downstream pipelines"
                    );
                }
            }
            JobExecutionStatus::Succeeded => {
                if pipeline_state(pipeline_id) != GroupState::Succeeded {
                    return Ok(finished);
                }
                let candidates = members.iter().filter(|j| {
                    j.status == JobExecutionStatus::Queued
                        && j.meta_flag(metadata::CHAIN_BLOCKED)
                        && metadata::list(&j.metadata, metadata::CHAIN_DEPENDS_ON_PIPELINES)
                            .iter()
                            .any(|d| d == pipeline_id)
                });
                for candidate in candidates {
                    let upstreams =
                        metadata::list(&candidate.metadata, metadata::CHAIN_DEPENDS_ON_PIPELINES);
                    if !upstreams
                        .iter()
                        .all(|u| pipeline_state(u) == GroupState::Succeeded)
                    {
                        continue;
                    }
                    let mut producers = BTreeMap::new();
                    for upstream in &upstreams {
                        let upstream_jobs: Vec<JobExecution> = members
                            .iter()
                            .filter(|j| j.meta(metadata::PIPELINE_ID) == Some(upstream.as_str()))
                            .cloned()
                            .collect();
                        producers.extend(artifact_producers(upstream, &upstream_jobs));
                    }
                    let mut patch = QueuedPatch {
                        remove_metadata: vec![metadata::CHAIN_BLOCKED.to_string()],
                        set_env: artifact_env(&producers),
                        ..Default::default()
                    };
                    if !producers.is_empty() {
                        patch.set_metadata.insert(
                            metadata::DEP_ARTIFACT_JOB_IDS.to_string(),
                            encode_producers(&producers),
                        );
                    }
                    if self.jobs.patch_queued(candidate.id, &patch).await?.is_some() {
                        debug!(
                            job_execution_id = %candidate.id,
                            chain_run_id = %chain_run_id,
                            upstream = %pipeline_id,
                            "chain dependency satisfied; job unblocked"
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(finished)
    }

    /// Fail a queued dependent through the chain owner. Returns the failed
    /// execution, or `None` if it left the queue meanwhile.
    async fn cancel(
        &self,
        job: &JobExecution,
        chain: bool,
        reason: &str,
    ) -> Result<Option<JobExecution>> {
        let mut patch = QueuedPatch {
            remove_metadata: vec![
                metadata::CHAIN_BLOCKED.to_string(),
                metadata::NEEDS_BLOCKED.to_string(),
            ],
            ..Default::default()
        };
        if chain {
            patch
                .set_metadata
                .insert(metadata::CHAIN_CANCELLED.to_string(), FLAG_SET.to_string());
        }
        if self.jobs.patch_queued(job.id, &patch).await?.is_none() {
            return Ok(None);
        }

        let mut update = JobStatusUpdate::failed_by(SERVER_CHAIN_AGENT, reason);
        update.output = Some(format!("[chain] {reason}"));
        match self.jobs.update_status(job.id, &update, Utc::now()).await {
            Ok(failed) => {
                debug!(job_execution_id = %job.id, reason, "cancelled dependent job");
                Ok(Some(failed))
            }
            Err(Error::AlreadyTerminal(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ciwi_core::ids::JobExecutionId;

    fn job(status: JobExecutionStatus) -> JobExecution {
        JobExecution {
            id: JobExecutionId::new(),
            script: String::new(),
            env: Default::default(),
            required_capabilities: Default::default(),
            timeout_seconds: 1,
            artifact_globs: vec![],
            caches: vec![],
            source: None,
            step_plan: vec![],
            metadata: Default::default(),
            current_step: String::new(),
            status,
            created_utc: Utc::now(),
            started_utc: None,
            finished_utc: None,
            leased_by_agent_id: None,
            leased_utc: None,
            exit_code: None,
            error: None,
            output: String::new(),
            sensitive_values: vec![],
        }
    }

    #[test]
    fn test_group_state() {
        use JobExecutionStatus::*;
        let all = |s: &[JobExecutionStatus]| s.iter().map(|&st| job(st)).collect::<Vec<_>>();
        assert_eq!(group_state(all(&[]).iter()), GroupState::Pending);
        assert_eq!(group_state(all(&[Succeeded, Succeeded]).iter()), GroupState::Succeeded);
        assert_eq!(group_state(all(&[Failed, Succeeded]).iter()), GroupState::Failed);
        assert_eq!(group_state(all(&[Failed, Running]).iter()), GroupState::Pending);
    }
}
