//! Project handlers: import, reload and vault binding.

use axum::{
    Json,
    extract::{Path, State},
};
use ciwi_core::Error;
use ciwi_core::ids::ProjectId;
use ciwi_core::project::{ImportProjectRequest, Project, ProjectDetail, ProjectVaultSettings};
use ciwi_core::vault::VaultProbe;
use ciwi_secrets::{probe_connection, probe_secrets};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiJson, ApiResult, parse_id};
use crate::state::AppState;

fn project_id(raw: &str) -> ApiResult<ProjectId> {
    parse_id(raw, "project id")
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub projects: Vec<Project>,
}

pub async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<Json<ProjectsResponse>> {
    Ok(Json(ProjectsResponse {
        projects: state.projects.list().await?,
    }))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    Ok(Json(state.projects.detail(project_id(&id)?).await?))
}

pub async fn import_project(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<ImportProjectRequest>,
) -> ApiResult<Json<ProjectDetail>> {
    let detail = state.projects.import(&request).await?;
    info!(
        project = %detail.project.name,
        commit = %detail.project.loaded_commit,
        "project imported"
    );
    Ok(Json(detail))
}

pub async fn reload_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    Ok(Json(state.projects.reload(project_id(&id)?).await?))
}

pub async fn get_vault(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectVaultSettings>> {
    Ok(Json(state.projects.vault(project_id(&id)?).await?))
}

pub async fn put_vault(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(settings): ApiJson<ProjectVaultSettings>,
) -> ApiResult<Json<ProjectVaultSettings>> {
    let project = state.projects.set_vault(project_id(&id)?, &settings).await?;
    Ok(Json(project.vault))
}

#[derive(Debug, Serialize)]
pub struct VaultTestResponse {
    pub ok: bool,
    pub connection: VaultProbe,
    pub secrets: Vec<VaultProbe>,
}

/// Log in with the bound connection and read every bound secret.
pub async fn test_vault(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VaultTestResponse>> {
    let settings = state.projects.vault(project_id(&id)?).await?;
    let name = settings
        .connection_name()
        .ok_or_else(|| Error::constraint("project has no vault connection"))?;
    let conn = state
        .vaults
        .get_by_name(name)
        .await?
        .ok_or_else(|| Error::not_found(format!("vault connection {name:?} not found")))?;

    let connection = probe_connection(&state.vault_client, &conn).await;
    let secrets = if connection.ok {
        probe_secrets(&state.vault_client, &conn, &settings.secrets).await
    } else {
        Vec::new()
    };
    let ok = connection.ok && secrets.iter().all(|s| s.ok);
    Ok(Json(VaultTestResponse {
        ok,
        connection,
        secrets,
    }))
}
