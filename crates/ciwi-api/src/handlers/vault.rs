use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use ciwi_core::Error;
use ciwi_core::ids::VaultConnectionId;
use ciwi_core::vault::{UpsertVaultConnection, VaultConnection, VaultProbe};
use ciwi_secrets::probe_connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiJson, ApiResult, parse_id};
use crate::state::AppState;

fn connection_id(raw: &str) -> ApiResult<VaultConnectionId> {
    parse_id(raw, "vault connection id")
}

#[derive(Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<VaultConnection>,
}

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ConnectionsResponse>> {
    Ok(Json(ConnectionsResponse {
        connections: state.vaults.list().await?,
    }))
}

pub async fn upsert_connection(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<UpsertVaultConnection>,
) -> ApiResult<Json<VaultConnection>> {
    request.validate()?;
    let conn = state.vaults.upsert(&request, Utc::now()).await?;
    state.vault_client.evict(conn.id).await;
    info!(vault_connection = %conn.name, id = %conn.id, "vault connection saved");
    Ok(Json(conn))
}

pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = connection_id(&id)?;
    state.vaults.delete(id).await?;
    state.vault_client.evict(id).await;
    info!(id = %id, "vault connection deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VaultProbe>> {
    let id = connection_id(&id)?;
    let conn = state
        .vaults
        .get(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("vault connection {id} not found")))?;
    Ok(Json(probe_connection(&state.vault_client, &conn).await))
}
