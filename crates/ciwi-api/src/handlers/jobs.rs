//! Job execution handlers: status protocol, listings and user operations.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
};
use ciwi_core::Error;
use ciwi_core::artifact::{Artifact, StoredTestReport, UploadArtifactsRequest, UploadTestReportRequest};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{JobExecution, JobStatusUpdate};
use ciwi_scheduler::{JobListQuery, JobListing};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiJson, ApiResult, parse_id};
use crate::state::AppState;

fn job_id(raw: &str) -> ApiResult<JobExecutionId> {
    parse_id(raw, "job execution id")
}

fn require_agent(agent_id: &str) -> ApiResult<()> {
    if agent_id.trim().is_empty() {
        return Err(Error::invalid("agent_id is required").into());
    }
    Ok(())
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<JobListQuery>, QueryRejection>,
) -> ApiResult<Json<JobListing>> {
    let Query(query) = query.map_err(|e| ApiError(Error::invalid(e.body_text())))?;
    Ok(Json(state.jobs.list(&query).await?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobExecution>> {
    Ok(Json(state.jobs.get(job_id(&id)?).await?))
}

pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.jobs.delete_queued(job_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn force_fail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobExecution>> {
    Ok(Json(state.jobs.force_fail(job_id(&id)?).await?))
}

#[derive(Serialize)]
pub struct RemovedResponse {
    pub removed: u64,
}

pub async fn clear_queue(State(state): State<Arc<AppState>>) -> ApiResult<Json<RemovedResponse>> {
    Ok(Json(RemovedResponse {
        removed: state.jobs.clear_queue().await?,
    }))
}

pub async fn flush_history(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<RemovedResponse>> {
    Ok(Json(RemovedResponse {
        removed: state.jobs.flush_history().await?,
    }))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<JobStatusUpdate>,
) -> ApiResult<Json<JobExecution>> {
    let id = job_id(&id)?;
    require_agent(&update.agent_id)?;
    Ok(Json(state.jobs.update_status(id, &update).await?))
}

#[derive(Serialize)]
pub struct ArtifactsResponse {
    pub artifacts: Vec<Artifact>,
}

pub async fn upload_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UploadArtifactsRequest>,
) -> ApiResult<Json<ArtifactsResponse>> {
    let id = job_id(&id)?;
    require_agent(&request.agent_id)?;
    state.jobs.get(id).await?;

    let artifacts = state.artifacts.persist(id, &request.artifacts).await?;
    state.jobs.add_artifacts(id, &artifacts).await?;
    info!(
        job_execution_id = %id,
        agent_id = %request.agent_id,
        count = artifacts.len(),
        "artifacts uploaded"
    );
    Ok(Json(ArtifactsResponse { artifacts }))
}

pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ArtifactsResponse>> {
    Ok(Json(ArtifactsResponse {
        artifacts: state.jobs.artifacts(job_id(&id)?).await?,
    }))
}

pub async fn upload_test_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<UploadTestReportRequest>,
) -> ApiResult<Json<StoredTestReport>> {
    let id = job_id(&id)?;
    require_agent(&request.agent_id)?;
    state.jobs.save_test_report(id, &request.report).await?;
    Ok(Json(state.jobs.test_report(id).await?))
}

pub async fn get_test_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StoredTestReport>> {
    Ok(Json(state.jobs.test_report(job_id(&id)?).await?))
}
