//! Persisted projects, pipelines and chains.

use crate::config::{PipelineSpec, ProjectConfig};
use crate::ids::{ChainDbId, PipelineDbId, ProjectId};
use crate::vault::SecretRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub repo_ref: String,
    #[serde(default)]
    pub config_path: String,
    #[serde(default)]
    pub loaded_commit: String,
    pub updated_utc: DateTime<Utc>,
    #[serde(default)]
    pub vault: ProjectVaultSettings,
}

/// Vault binding stored for a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectVaultSettings {
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
}

impl ProjectVaultSettings {
    pub fn connection_name(&self) -> Option<&str> {
        self.connection
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    pub fn is_configured(&self) -> bool {
        self.connection_name().is_some()
    }

    pub fn secret(&self, name: &str) -> Option<&SecretRef> {
        self.secrets.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPipeline {
    pub id: PipelineDbId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub pipeline_id: String,
    pub position: u32,
    pub spec: PipelineSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedChain {
    pub id: ChainDbId,
    pub project_id: ProjectId,
    pub project_name: String,
    pub chain_id: String,
    pub pipelines: Vec<String>,
}

/// Everything needed to create or replace a project from a parsed config.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectImport {
    pub repo_url: String,
    pub repo_ref: String,
    pub config_path: String,
    pub loaded_commit: String,
    pub config: ProjectConfig,
}

impl ProjectImport {
    /// Vault binding carried by the config file, if any.
    pub fn vault_settings(&self) -> Option<ProjectVaultSettings> {
        let vault = self.config.project.vault.as_ref()?;
        Some(ProjectVaultSettings {
            connection: Some(vault.connection.clone()).filter(|c| !c.trim().is_empty()),
            secrets: vault.secrets.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProjectRequest {
    pub repo_url: String,
    #[serde(default)]
    pub repo_ref: String,
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

fn default_config_path() -> String {
    crate::config::DEFAULT_CONFIG_FILE.to_string()
}

/// Project with its pipelines and chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub pipelines: Vec<PersistedPipeline>,
    pub chains: Vec<PersistedChain>,
}
