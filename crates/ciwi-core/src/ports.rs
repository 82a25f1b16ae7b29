//! Port traits (hexagonal architecture).
//!
//! The store, the source repository and the secret service are reached only
//! through these traits.

use crate::artifact::{Artifact, StoredTestReport, TestReport};
use crate::capability::CapabilityMap;
use crate::ids::*;
use crate::job::{
    CreateJobExecution, JobExecution, JobExecutionStatus, JobStatusUpdate, JobSummary,
    StepPlanItem,
};
use crate::metadata::Metadata;
use crate::project::{
    PersistedChain, PersistedPipeline, Project, ProjectDetail, ProjectImport, ProjectVaultSettings,
};
use crate::source::{FetchedFile, ReportFn, ResolvedVersion, VersionRequest};
use crate::vault::{UpsertVaultConnection, VaultConnection};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Repository for projects and their pipelines and chains.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Create or replace a project (matched by name) and all of its
    /// pipelines and chains in one transaction.
    async fn upsert_project(&self, import: &ProjectImport) -> Result<ProjectDetail>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>>;

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn get_project_detail(&self, id: ProjectId) -> Result<Option<ProjectDetail>>;

    async fn set_project_vault(
        &self,
        id: ProjectId,
        settings: &ProjectVaultSettings,
    ) -> Result<Project>;

    async fn get_pipeline(&self, id: PipelineDbId) -> Result<Option<PersistedPipeline>>;

    async fn get_pipeline_by_name(
        &self,
        project_id: ProjectId,
        pipeline_id: &str,
    ) -> Result<Option<PersistedPipeline>>;

    async fn list_pipelines(&self, project_id: ProjectId) -> Result<Vec<PersistedPipeline>>;

    async fn get_chain(&self, id: ChainDbId) -> Result<Option<PersistedChain>>;

    async fn list_chains(&self, project_id: ProjectId) -> Result<Vec<PersistedChain>>;
}

/// Filter for job execution listings.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    /// Empty means any status.
    pub statuses: Vec<JobExecutionStatus>,
    /// Every pair must match exactly.
    pub metadata: Vec<(String, String)>,
    pub newest_first: bool,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl JobListFilter {
    pub fn with_status(mut self, status: JobExecutionStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.push((key.to_string(), value.into()));
        self
    }
}

/// Changes applied to a queued execution by the chain and `needs` runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuedPatch {
    pub set_metadata: Metadata,
    pub remove_metadata: Vec<String>,
    pub set_env: BTreeMap<String, String>,
}

/// Result of a lease attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Leased(Box<JobExecution>),
    /// Nothing leasable is queued.
    NoneQueued,
    /// Leasable work exists but the agent does not satisfy it.
    NoMatch { reason: String },
}

/// Repository for job executions, their artifacts and test reports.
#[async_trait]
pub trait JobExecutionRepository: Send + Sync {
    /// Persist a batch of pending jobs as queued executions, all or nothing.
    async fn create_batch(
        &self,
        jobs: &[CreateJobExecution],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>>;

    async fn get(&self, id: JobExecutionId) -> Result<Option<JobExecution>>;

    async fn list(&self, filter: &JobListFilter) -> Result<Vec<JobExecution>>;

    async fn summary(&self) -> Result<JobSummary>;

    /// Atomically pick the oldest unblocked queued execution the agent
    /// satisfies and mark it leased.
    async fn lease_next(
        &self,
        agent_id: &str,
        capabilities: &CapabilityMap,
        now: DateTime<Utc>,
    ) -> Result<LeaseOutcome>;

    /// Apply a status report, enforcing ownership and terminal rules.
    async fn update_status(
        &self,
        id: JobExecutionId,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<JobExecution>;

    /// Record values discovered during secret resolution.
    async fn record_sensitive_values(&self, id: JobExecutionId, values: &[String]) -> Result<()>;

    /// Apply `patch` if the execution is still queued.
    async fn patch_queued(
        &self,
        id: JobExecutionId,
        patch: &QueuedPatch,
    ) -> Result<Option<JobExecution>>;

    /// Delete a queued execution; anything else is a conflict.
    async fn delete_queued(&self, id: JobExecutionId) -> Result<()>;

    /// Delete every queued execution, returning how many were removed.
    async fn clear_queued(&self) -> Result<u64>;

    /// Delete every terminal execution with its artifacts and reports.
    async fn flush_history(&self) -> Result<u64>;

    async fn requeue_stale_leased(&self, now: DateTime<Utc>, stale_after: Duration)
    -> Result<u64>;

    /// Fail running executions past `started + timeout + grace`, returning
    /// the updated rows.
    async fn fail_timed_out_running(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        marker: &str,
    ) -> Result<Vec<JobExecution>>;

    /// All executions of the most recently created run of a pipeline.
    async fn latest_pipeline_run(
        &self,
        project: &str,
        pipeline_id: &str,
    ) -> Result<Vec<JobExecution>>;

    /// Most recent succeeded execution of a pipeline that recorded a
    /// resolved source ref.
    async fn latest_succeeded_with_source(
        &self,
        project: &str,
        pipeline_id: &str,
    ) -> Result<Option<JobExecution>>;

    async fn has_active_for_agent(&self, agent_id: &str) -> Result<bool>;

    async fn add_artifacts(&self, artifacts: &[Artifact]) -> Result<()>;

    async fn list_artifacts(&self, id: JobExecutionId) -> Result<Vec<Artifact>>;

    async fn save_test_report(
        &self,
        id: JobExecutionId,
        report: &TestReport,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_test_report(&self, id: JobExecutionId) -> Result<Option<StoredTestReport>>;
}

/// Repository for vault connections.
#[async_trait]
pub trait VaultRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<VaultConnection>>;

    async fn get(&self, id: VaultConnectionId) -> Result<Option<VaultConnection>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<VaultConnection>>;

    async fn upsert(
        &self,
        connection: &UpsertVaultConnection,
        now: DateTime<Utc>,
    ) -> Result<VaultConnection>;

    async fn delete(&self, id: VaultConnectionId) -> Result<()>;
}

/// Namespaced key-value store for coordination values.
#[async_trait]
pub trait AppStateRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
}

/// Operations against remote source repositories.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Check out `git_ref` and read the version file.
    async fn resolve_version(
        &self,
        request: &VersionRequest,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion>;

    /// Read one file at a ref, returning its content and the commit read.
    async fn read_file(&self, repo_url: &str, git_ref: &str, path: &str) -> Result<FetchedFile>;
}

/// Outcome of resolving the secrets of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretResolution {
    pub step_plan: Vec<StepPlanItem>,
    pub sensitive_values: Vec<String>,
    /// Number of steps that needed resolution.
    pub resolved_steps: usize,
}

/// Resolves `{{ secret.<name> }}` placeholders in a step plan.
#[async_trait]
pub trait StepSecretResolver: Send + Sync {
    async fn resolve(&self, job: &JobExecution) -> Result<SecretResolution>;
}
