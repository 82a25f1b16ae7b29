//! Health and server info handlers.

use axum::Json;
use serde::Serialize;

pub const API_VERSION: u32 = 1;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub struct ServerInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub api_version: u32,
}

pub async fn server_info() -> Json<ServerInfo> {
    Json(ServerInfo {
        name: "ciwi",
        version: env!("CARGO_PKG_VERSION"),
        api_version: API_VERSION,
    })
}
