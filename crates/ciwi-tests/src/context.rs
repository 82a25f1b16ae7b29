//! Test context over a temporary store.

use crate::helpers::{PassthroughSecrets, ScriptedSource};
use ciwi_api::{AppState, Collaborators, Repositories};
use ciwi_core::agent::LeaseRequest;
use ciwi_core::capability::CapabilityMap;
use ciwi_core::ids::{ChainDbId, JobExecutionId, PipelineDbId};
use ciwi_core::job::{JobExecution, JobStatusUpdate};
use ciwi_core::metadata;
use ciwi_core::ports::{JobExecutionRepository, JobListFilter};
use ciwi_core::project::ProjectDetail;
use ciwi_db::{
    Database, SqliteAppStateRepository, SqliteJobExecutionRepository, SqliteProjectRepository,
    SqliteVaultRepository,
};
use ciwi_scheduler::SchedulerConfig;
use ciwi_secrets::{DEFAULT_VAULT_DEADLINE, VaultClient};
use std::sync::Arc;
use tempfile::TempDir;

/// Services wired over a fresh database. Drop it to remove the directory.
pub struct TestContext {
    pub state: Arc<AppState>,
    pub jobs: Arc<dyn JobExecutionRepository>,
    pub source: Arc<ScriptedSource>,
    pub db: Database,
    dir: TempDir,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(SchedulerConfig::default()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let dir = tempfile::tempdir()?;
        let db = Database::open(dir.path().join("ciwi.db")).await?;
        let jobs: Arc<dyn JobExecutionRepository> =
            Arc::new(SqliteJobExecutionRepository::new(db.clone()));
        let source = Arc::new(ScriptedSource::new("1.0.0"));

        let state = AppState::assemble(
            Repositories {
                jobs: jobs.clone(),
                projects: Arc::new(SqliteProjectRepository::new(db.clone())),
                vaults: Arc::new(SqliteVaultRepository::new(db.clone())),
                app_state: Arc::new(SqliteAppStateRepository::new(db.clone())),
            },
            Collaborators {
                source: source.clone(),
                secrets: Arc::new(PassthroughSecrets),
                vault_client: Arc::new(VaultClient::new(DEFAULT_VAULT_DEADLINE)?),
            },
            config,
            dir.path().join("artifacts"),
        );

        Ok(Self {
            state: Arc::new(state),
            jobs,
            source,
            db,
            dir,
        })
    }

    /// Write `yaml` to disk and load it as a local project.
    pub async fn load_project(&self, yaml: &str) -> anyhow::Result<ProjectDetail> {
        let path = self.dir.path().join("ciwi-project.yaml");
        tokio::fs::write(&path, yaml).await?;
        Ok(self.state.projects.load_local(&path).await?)
    }

    pub fn pipeline(detail: &ProjectDetail, pipeline_id: &str) -> anyhow::Result<PipelineDbId> {
        detail
            .pipelines
            .iter()
            .find(|p| p.pipeline_id == pipeline_id)
            .map(|p| p.id)
            .ok_or_else(|| anyhow::anyhow!("pipeline {pipeline_id} not in project"))
    }

    pub fn chain(detail: &ProjectDetail, chain_id: &str) -> anyhow::Result<ChainDbId> {
        detail
            .chains
            .iter()
            .find(|c| c.chain_id == chain_id)
            .map(|c| c.id)
            .ok_or_else(|| anyhow::anyhow!("chain {chain_id} not in project"))
    }

    /// Lease the next job for `agent_id` advertising `capabilities`.
    pub async fn lease(
        &self,
        agent_id: &str,
        capabilities: CapabilityMap,
    ) -> anyhow::Result<Option<JobExecution>> {
        let response = self
            .state
            .lease
            .lease(&LeaseRequest {
                agent_id: agent_id.to_string(),
                capabilities,
            })
            .await?;
        Ok(response.job_execution)
    }

    pub async fn report(
        &self,
        id: JobExecutionId,
        agent_id: &str,
        status: &str,
        error: Option<&str>,
        output: Option<&str>,
    ) -> anyhow::Result<JobExecution> {
        let update = JobStatusUpdate {
            agent_id: agent_id.to_string(),
            status: status.to_string(),
            error: error.map(str::to_string),
            output: output.map(str::to_string),
            current_step: None,
            exit_code: None,
            timestamp_utc: None,
        };
        Ok(self.state.jobs.update_status(id, &update).await?)
    }

    /// Report `running` then `succeeded` with output `ok`.
    pub async fn succeed(&self, id: JobExecutionId, agent_id: &str) -> anyhow::Result<JobExecution> {
        self.report(id, agent_id, "running", None, None).await?;
        self.report(id, agent_id, "succeeded", None, Some("ok")).await
    }

    /// Report `running` then `failed` with `error`.
    pub async fn fail(
        &self,
        id: JobExecutionId,
        agent_id: &str,
        error: &str,
    ) -> anyhow::Result<JobExecution> {
        self.report(id, agent_id, "running", None, None).await?;
        self.report(id, agent_id, "failed", Some(error), None).await
    }

    pub async fn job(&self, id: JobExecutionId) -> anyhow::Result<JobExecution> {
        Ok(self.state.jobs.get(id).await?)
    }

    /// Every execution of `pipeline_id`, oldest first.
    pub async fn executions_of(&self, pipeline_id: &str) -> anyhow::Result<Vec<JobExecution>> {
        Ok(self
            .jobs
            .list(&JobListFilter::default().with_meta(metadata::PIPELINE_ID, pipeline_id))
            .await?)
    }

    /// The only execution of `pipeline_id`.
    pub async fn only_execution_of(&self, pipeline_id: &str) -> anyhow::Result<JobExecution> {
        let mut executions = self.executions_of(pipeline_id).await?;
        match executions.len() {
            1 => Ok(executions.remove(0)),
            n => anyhow::bail!("expected one execution of {pipeline_id}, found {n}"),
        }
    }
}
