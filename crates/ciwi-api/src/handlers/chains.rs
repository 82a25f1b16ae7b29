use axum::{
    Json,
    extract::{Path, State},
};
use ciwi_core::ids::ChainDbId;
use ciwi_scheduler::{EnqueueResponse, Selection};
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiJson, ApiResult, parse_id};
use crate::state::AppState;

async fn enqueue_chain(
    state: &AppState,
    raw_id: &str,
    selection: &Selection,
) -> ApiResult<Json<EnqueueResponse>> {
    let id: ChainDbId = parse_id(raw_id, "pipeline chain id")?;
    let response = state.enqueue.run_chain(id, selection).await?;
    info!(
        chain_id = ?response.pipeline_chain_id,
        chain_run_id = ?response.chain_run_id,
        jobs = response.job_execution_ids.len(),
        "pipeline chain enqueued"
    );
    Ok(Json(response))
}

pub async fn run_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EnqueueResponse>> {
    enqueue_chain(&state, &id, &Selection::default()).await
}

pub async fn run_chain_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(selection): ApiJson<Selection>,
) -> ApiResult<Json<EnqueueResponse>> {
    enqueue_chain(&state, &id, &selection).await
}
