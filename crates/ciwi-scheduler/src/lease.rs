//! Lease protocol: hand the oldest matching queued execution to an agent.

use crate::agents::AgentCoordinator;
use crate::runtime::DependencyRuntime;
use chrono::Utc;
use ciwi_core::agent::LeaseRequest;
use ciwi_core::capability::{KEY_AGENT_ID, merge_capabilities};
use ciwi_core::job::{JobExecution, JobStatusUpdate, SERVER_CONTROL_AGENT};
use ciwi_core::metadata::{self, FLAG_SET};
use ciwi_core::ports::{JobExecutionRepository, LeaseOutcome, StepSecretResolver};
use ciwi_core::vault::contains_placeholder;
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub assigned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_execution: Option<JobExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LeaseResponse {
    fn assigned(job: JobExecution) -> Self {
        Self {
            assigned: true,
            job_execution: Some(job),
            message: None,
        }
    }

    fn not_assigned(message: impl Into<String>) -> Self {
        Self {
            assigned: false,
            job_execution: None,
            message: Some(message.into()),
        }
    }
}

fn needs_secrets(job: &JobExecution) -> bool {
    job.step_plan.iter().any(|s| s.needs_secret_resolution())
        || job.env.values().any(|v| contains_placeholder(v))
}

pub struct LeaseService {
    jobs: Arc<dyn JobExecutionRepository>,
    agents: Arc<AgentCoordinator>,
    secrets: Arc<dyn StepSecretResolver>,
    runtime: Arc<DependencyRuntime>,
}

impl LeaseService {
    pub fn new(
        jobs: Arc<dyn JobExecutionRepository>,
        agents: Arc<AgentCoordinator>,
        secrets: Arc<dyn StepSecretResolver>,
        runtime: Arc<DependencyRuntime>,
    ) -> Self {
        Self {
            jobs,
            agents,
            secrets,
            runtime,
        }
    }

    pub async fn lease(&self, request: &LeaseRequest) -> Result<LeaseResponse> {
        let agent_id = request.agent_id.trim();
        if agent_id.is_empty() {
            return Err(Error::invalid("agent_id is required"));
        }
        if self.agents.is_deactivated(agent_id) {
            debug!(agent_id, "lease refused, agent deactivated");
            return Ok(LeaseResponse::not_assigned("agent is deactivated"));
        }

        let mut capabilities =
            merge_capabilities(&self.agents.stored_capabilities(agent_id), &request.capabilities);
        capabilities.insert(KEY_AGENT_ID.to_string(), agent_id.to_string());

        let mut job = match self.jobs.lease_next(agent_id, &capabilities, Utc::now()).await? {
            LeaseOutcome::Leased(job) => *job,
            LeaseOutcome::NoneQueued => {
                return Ok(LeaseResponse::not_assigned("no queued jobs"));
            }
            LeaseOutcome::NoMatch { reason } => {
                debug!(agent_id, reason = %reason, "no matching job for agent");
                return Ok(LeaseResponse::not_assigned(reason));
            }
        };

        if needs_secrets(&job) {
            match self.secrets.resolve(&job).await {
                Ok(resolution) => {
                    self.jobs
                        .record_sensitive_values(job.id, &resolution.sensitive_values)
                        .await?;
                    for value in resolution.sensitive_values {
                        if !value.is_empty() && !job.sensitive_values.contains(&value) {
                            job.sensitive_values.push(value);
                        }
                    }
                    job.step_plan = resolution.step_plan;
                    job.metadata
                        .insert(metadata::HAS_SECRETS.to_string(), FLAG_SET.to_string());
                }
                Err(e) => return self.fail_secret_resolution(&job, agent_id, e).await,
            }
        }

        info!(
            job_execution_id = %job.id,
            agent_id,
            pipeline_id = job.meta(metadata::PIPELINE_ID).unwrap_or_default(),
            "job execution assigned"
        );
        Ok(LeaseResponse::assigned(job))
    }

    async fn fail_secret_resolution(
        &self,
        job: &JobExecution,
        agent_id: &str,
        error: Error,
    ) -> Result<LeaseResponse> {
        let reason = error.to_string();
        warn!(
            job_execution_id = %job.id,
            agent_id,
            error = %reason,
            "secret resolution failed; failing job execution"
        );
        let mut update = JobStatusUpdate::failed_by(SERVER_CONTROL_AGENT, reason.clone());
        update.output = Some(format!("[control] secret resolution failed: {reason}"));
        let failed = self.jobs.update_status(job.id, &update, Utc::now()).await?;
        self.runtime.on_job_updated(&failed).await?;
        Ok(LeaseResponse::not_assigned(format!(
            "secret resolution failed: {reason}"
        )))
    }
}
