//! Application state shared across handlers.

use crate::artifacts::ArtifactStore;
use ciwi_core::ports::{
    AppStateRepository, JobExecutionRepository, ProjectRepository, SourceRepository,
    StepSecretResolver, VaultRepository,
};
use ciwi_scheduler::{
    AgentCoordinator, DependencyRuntime, EnqueueService, JobService, LeaseService,
    MaintenanceService, PipelineExpander, ProjectService, RunIdGenerator, SchedulerConfig,
};
use ciwi_secrets::VaultClient;
use std::path::PathBuf;
use std::sync::Arc;

/// Store repositories the services are built on.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobExecutionRepository>,
    pub projects: Arc<dyn ProjectRepository>,
    pub vaults: Arc<dyn VaultRepository>,
    pub app_state: Arc<dyn AppStateRepository>,
}

/// Outside collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceRepository>,
    pub secrets: Arc<dyn StepSecretResolver>,
    pub vault_client: Arc<VaultClient>,
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<ProjectService>,
    pub enqueue: Arc<EnqueueService>,
    pub jobs: Arc<JobService>,
    pub lease: Arc<LeaseService>,
    pub agents: Arc<AgentCoordinator>,
    pub maintenance: Arc<MaintenanceService>,
    pub vaults: Arc<dyn VaultRepository>,
    pub vault_client: Arc<VaultClient>,
    pub artifacts: ArtifactStore,
}

impl AppState {
    /// Wire every service over one set of repositories.
    pub fn assemble(
        repos: Repositories,
        collaborators: Collaborators,
        config: SchedulerConfig,
        artifacts_dir: impl Into<PathBuf>,
    ) -> Self {
        let runtime = Arc::new(DependencyRuntime::new(repos.jobs.clone()));
        let agents = Arc::new(AgentCoordinator::new(
            repos.jobs.clone(),
            repos.app_state.clone(),
            config.clone(),
        ));
        let expander = PipelineExpander::new(
            repos.jobs.clone(),
            collaborators.source.clone(),
            Arc::new(RunIdGenerator::new()),
            config.clone(),
        );

        Self {
            projects: Arc::new(ProjectService::new(
                repos.projects.clone(),
                repos.vaults.clone(),
                collaborators.source,
            )),
            enqueue: Arc::new(EnqueueService::new(
                repos.projects,
                repos.jobs.clone(),
                expander,
            )),
            jobs: Arc::new(JobService::new(repos.jobs.clone(), runtime.clone())),
            lease: Arc::new(LeaseService::new(
                repos.jobs.clone(),
                agents.clone(),
                collaborators.secrets,
                runtime.clone(),
            )),
            agents,
            maintenance: Arc::new(MaintenanceService::new(repos.jobs, runtime, config)),
            vaults: repos.vaults,
            vault_client: collaborators.vault_client,
            artifacts: ArtifactStore::new(artifacts_dir),
        }
    }
}
