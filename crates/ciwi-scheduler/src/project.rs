//! Project import, reload and vault binding.

use crate::validate::validate_project_config;
use ciwi_core::config::{DEFAULT_CONFIG_FILE, ProjectConfig};
use ciwi_core::ids::ProjectId;
use ciwi_core::ports::{ProjectRepository, SourceRepository, VaultRepository};
use ciwi_core::project::{
    ImportProjectRequest, Project, ProjectDetail, ProjectImport, ProjectVaultSettings,
};
use ciwi_core::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct ProjectService {
    projects: Arc<dyn ProjectRepository>,
    vaults: Arc<dyn VaultRepository>,
    source: Arc<dyn SourceRepository>,
}

impl ProjectService {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        vaults: Arc<dyn VaultRepository>,
        source: Arc<dyn SourceRepository>,
    ) -> Self {
        Self {
            projects,
            vaults,
            source,
        }
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        self.projects.list_projects().await
    }

    pub async fn get(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .get_project(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {id} not found")))
    }

    pub async fn detail(&self, id: ProjectId) -> Result<ProjectDetail> {
        self.projects
            .get_project_detail(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {id} not found")))
    }

    /// Fetch a project file from a repository and store the project.
    pub async fn import(&self, request: &ImportProjectRequest) -> Result<ProjectDetail> {
        let repo_url = request.repo_url.trim();
        if repo_url.is_empty() {
            return Err(Error::invalid("repo_url is required"));
        }
        let config_path = Some(request.config_path.trim())
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_CONFIG_FILE);
        let repo_ref = request.repo_ref.trim();

        let fetched = self.source.read_file(repo_url, repo_ref, config_path).await?;
        let config = parse_config(&fetched.content)?;
        let detail = self
            .projects
            .upsert_project(&ProjectImport {
                repo_url: repo_url.to_string(),
                repo_ref: repo_ref.to_string(),
                config_path: config_path.to_string(),
                loaded_commit: fetched.commit,
                config,
            })
            .await?;
        info!(
            project = %detail.project.name,
            repo_url,
            commit = %detail.project.loaded_commit,
            pipelines = detail.pipelines.len(),
            "imported project"
        );
        Ok(detail)
    }

    /// Re-fetch a project from the repository it was imported from.
    pub async fn reload(&self, id: ProjectId) -> Result<ProjectDetail> {
        let project = self.get(id).await?;
        if project.repo_url.trim().is_empty() {
            return Err(Error::constraint(format!(
                "project {} was loaded from a local file and cannot be reloaded",
                project.name
            )));
        }
        self.import(&ImportProjectRequest {
            repo_url: project.repo_url,
            repo_ref: project.repo_ref,
            config_path: project.config_path,
        })
        .await
    }

    /// Load a project file from disk.
    pub async fn load_local(&self, path: &Path) -> Result<ProjectDetail> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = parse_config(&content)?;
        let detail = self
            .projects
            .upsert_project(&ProjectImport {
                repo_url: String::new(),
                repo_ref: String::new(),
                config_path: path.display().to_string(),
                loaded_commit: String::new(),
                config,
            })
            .await?;
        info!(project = %detail.project.name, path = %path.display(), "loaded local project");
        Ok(detail)
    }

    pub async fn vault(&self, id: ProjectId) -> Result<ProjectVaultSettings> {
        Ok(self.get(id).await?.vault)
    }

    pub async fn set_vault(
        &self,
        id: ProjectId,
        settings: &ProjectVaultSettings,
    ) -> Result<Project> {
        if let Some(name) = settings.connection_name()
            && self.vaults.get_by_name(name).await?.is_none()
        {
            return Err(Error::invalid(format!("vault connection {name:?} does not exist")));
        }
        for (i, secret) in settings.secrets.iter().enumerate() {
            if secret.name.trim().is_empty() || secret.path.trim().is_empty() || secret.key.trim().is_empty() {
                return Err(Error::invalid(format!(
                    "secret {} needs a name, a path and a key",
                    i + 1
                )));
            }
            if settings.secrets[..i].iter().any(|s| s.name == secret.name) {
                return Err(Error::invalid(format!("duplicate secret {:?}", secret.name)));
            }
        }
        self.projects.set_project_vault(id, settings).await
    }
}

fn parse_config(content: &str) -> Result<ProjectConfig> {
    let config = ProjectConfig::from_yaml(content)?;
    validate_project_config(&config)?;
    Ok(config)
}
