//! Agent-facing protocol and agent operations.

use axum::{
    Json,
    extract::{Path, State},
};
use ciwi_core::agent::{
    AgentAction, AgentView, HeartbeatRequest, HeartbeatResponse, LeaseRequest,
};
use ciwi_scheduler::{ActionResponse, LeaseResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    Ok(Json(state.agents.heartbeat(&request).await?))
}

pub async fn lease(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<LeaseRequest>,
) -> ApiResult<Json<LeaseResponse>> {
    Ok(Json(state.lease.lease(&request).await?))
}

#[derive(Serialize)]
pub struct ListAgentsResponse {
    pub agents: Vec<AgentView>,
    pub update_target: String,
}

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<ListAgentsResponse> {
    Json(ListAgentsResponse {
        agents: state.agents.list(),
        update_target: state.agents.update_target(),
    })
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentView>> {
    Ok(Json(state.agents.get(&agent_id)?))
}

pub async fn request_action(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    ApiJson(action): ApiJson<AgentAction>,
) -> ApiResult<Json<ActionResponse>> {
    Ok(Json(state.agents.request_action(&agent_id, &action).await?))
}

pub async fn deactivate(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentView>> {
    Ok(Json(state.agents.set_deactivated(&agent_id, true).await?))
}

pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentView>> {
    Ok(Json(state.agents.set_deactivated(&agent_id, false).await?))
}

#[derive(Serialize, Deserialize)]
pub struct UpdateTarget {
    #[serde(default)]
    pub target: String,
}

pub async fn get_update_target(State(state): State<Arc<AppState>>) -> Json<UpdateTarget> {
    Json(UpdateTarget {
        target: state.agents.update_target(),
    })
}

pub async fn set_update_target(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<UpdateTarget>,
) -> ApiResult<Json<UpdateTarget>> {
    state.agents.set_update_target(&body.target).await?;
    Ok(Json(UpdateTarget {
        target: state.agents.update_target(),
    }))
}
