//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, chains, health, jobs, pipelines, projects, vault};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let artifacts = ServeDir::new(state.artifacts.root());
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/healthz", get(health::healthz))
        .nest_service("/artifacts", artifacts)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(axum_middleware::from_fn(request_id))
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/server-info", get(health::server_info))
        .route("/heartbeat", post(agents::heartbeat))
        .route("/agent/lease", post(agents::lease))
        .nest("/agents", agent_routes())
        .nest("/jobs", job_routes())
        .nest("/projects", project_routes())
        .nest("/pipelines", pipeline_routes())
        .nest("/pipeline-chains", chain_routes())
        .nest("/vault", vault_routes())
}

fn agent_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(agents::list_agents))
        .route(
            "/update-target",
            get(agents::get_update_target).put(agents::set_update_target),
        )
        .route("/{id}", get(agents::get_agent))
        .route("/{id}/actions", post(agents::request_action))
        .route("/{id}/deactivate", post(agents::deactivate))
        .route("/{id}/activate", post(agents::activate))
}

fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(jobs::list_jobs))
        .route("/clear-queue", post(jobs::clear_queue))
        .route("/flush-history", post(jobs::flush_history))
        .route("/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/{id}/status", post(jobs::update_status))
        .route("/{id}/force-fail", post(jobs::force_fail))
        .route(
            "/{id}/artifacts",
            get(jobs::list_artifacts).post(jobs::upload_artifacts),
        )
        .route(
            "/{id}/tests",
            get(jobs::get_test_report).post(jobs::upload_test_report),
        )
}

fn project_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(projects::list_projects))
        .route("/import", post(projects::import_project))
        .route("/{id}", get(projects::get_project))
        .route("/{id}/reload", post(projects::reload_project))
        .route(
            "/{id}/vault",
            get(projects::get_vault).put(projects::put_vault),
        )
        .route("/{id}/vault-test", post(projects::test_vault))
}

fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}/run", post(pipelines::run_pipeline))
        .route("/{id}/run-selection", post(pipelines::run_selection))
        .route("/{id}/version-preview", get(pipelines::version_preview))
        .route("/{id}/version-resolve", get(pipelines::version_resolve))
}

fn chain_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}/run", post(chains::run_chain))
        .route("/{id}/run-selection", post(chains::run_chain_selection))
}

fn vault_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/connections",
            get(vault::list_connections).post(vault::upsert_connection),
        )
        .route("/connections/{id}", delete(vault::delete_connection))
        .route("/connections/{id}/test", post(vault::test_connection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Collaborators, Repositories};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use ciwi_core::ports::SourceRepository;
    use ciwi_core::source::{FetchedFile, ReportFn, ResolvedVersion, VersionRequest};
    use ciwi_core::{Error, Result};
    use ciwi_db::{
        Database, SqliteAppStateRepository, SqliteJobExecutionRepository, SqliteProjectRepository,
        SqliteVaultRepository,
    };
    use ciwi_scheduler::SchedulerConfig;
    use ciwi_secrets::{DEFAULT_VAULT_DEADLINE, VaultClient, VaultSecretResolver};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
version: 1
project:
  name: demo
pipelines:
  - id: build
    jobs:
      - id: unit
        runs_on: { os: linux }
        steps:
          - run: make test
"#;

    struct NoSource;

    #[async_trait]
    impl SourceRepository for NoSource {
        async fn resolve_version(
            &self,
            _: &VersionRequest,
            _: ReportFn<'_>,
        ) -> Result<ResolvedVersion> {
            Err(Error::upstream("no source in tests"))
        }

        async fn read_file(&self, _: &str, _: &str, _: &str) -> Result<FetchedFile> {
            Err(Error::upstream("no source in tests"))
        }
    }

    struct Harness {
        router: Router,
        pipeline: String,
        dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("ciwi.db")).await.unwrap();
        let vaults = Arc::new(SqliteVaultRepository::new(db.clone()));
        let vault_client = Arc::new(VaultClient::new(DEFAULT_VAULT_DEADLINE).unwrap());
        let state = AppState::assemble(
            Repositories {
                jobs: Arc::new(SqliteJobExecutionRepository::new(db.clone())),
                projects: Arc::new(SqliteProjectRepository::new(db.clone())),
                vaults: vaults.clone(),
                app_state: Arc::new(SqliteAppStateRepository::new(db)),
            },
            Collaborators {
                source: Arc::new(NoSource),
                secrets: Arc::new(VaultSecretResolver::new(vaults, vault_client.clone())),
                vault_client,
            },
            SchedulerConfig::default(),
            dir.path().join("artifacts"),
        );

        let config_path = dir.path().join("ciwi-project.yaml");
        std::fs::write(&config_path, CONFIG).unwrap();
        let detail = state.projects.load_local(&config_path).await.unwrap();
        Harness {
            router: create_router(Arc::new(state)),
            pipeline: detail.pipelines[0].id.to_string(),
            dir,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_request_id() {
        let h = harness().await;
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-7");

        let (status, info) = send(&h.router, "GET", "/api/v1/server-info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["name"], "ciwi");
        assert_eq!(info["api_version"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let h = harness().await;
        let (status, body) = send(&h.router, "GET", "/api/v1/jobs/not-a-job", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid job execution id"));

        let missing = ciwi_core::ids::JobExecutionId::new();
        let (status, _) = send(&h.router, "GET", &format!("/api/v1/jobs/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&h.router, "POST", "/api/v1/heartbeat", Some(json!({"hostname": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.router, "GET", "/api/v1/jobs?view=sideways", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_run_lease_report_cycle() {
        let h = harness().await;

        let (status, run) = send(
            &h.router,
            "POST",
            &format!("/api/v1/pipelines/{}/run", h.pipeline),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = run["job_execution_ids"][0].as_str().unwrap().to_string();

        let (_, listing) = send(&h.router, "GET", "/api/v1/jobs?view=summary", None).await;
        assert_eq!(listing["summary"]["queued"], 1);

        let (status, beat) = send(
            &h.router,
            "POST",
            "/api/v1/heartbeat",
            Some(json!({"agent_id": "agent-1", "os": "linux", "arch": "amd64", "capabilities": {"os": "linux"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(beat["accepted"], true);

        let (status, lease) = send(
            &h.router,
            "POST",
            "/api/v1/agent/lease",
            Some(json!({"agent_id": "agent-1", "capabilities": {"os": "linux"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lease["assigned"], true);
        assert_eq!(lease["job_execution"]["id"], job_id.as_str());

        let (status, _) = send(
            &h.router,
            "POST",
            &format!("/api/v1/jobs/{job_id}/status"),
            Some(json!({"agent_id": "agent-2", "status": "running"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, uploaded) = send(
            &h.router,
            "POST",
            &format!("/api/v1/jobs/{job_id}/artifacts"),
            Some(json!({
                "agent_id": "agent-1",
                "artifacts": [{"path": "dist/out.txt", "data_base64": STANDARD.encode("built")}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(uploaded["artifacts"][0]["size_bytes"], 5);
        let stored = std::fs::read_to_string(h.dir.path().join("artifacts").join(&job_id).join("dist/out.txt")).unwrap();
        assert_eq!(stored, "built");

        let (status, _) = send(
            &h.router,
            "POST",
            &format!("/api/v1/jobs/{job_id}/artifacts"),
            Some(json!({
                "agent_id": "agent-1",
                "artifacts": [{"path": "../etc/passwd", "data_base64": ""}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, done) = send(
            &h.router,
            "POST",
            &format!("/api/v1/jobs/{job_id}/status"),
            Some(json!({"agent_id": "agent-1", "status": "success", "exit_code": 0, "output": "ok"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "succeeded");

        let (status, _) = send(&h.router, "DELETE", &format!("/api/v1/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, history) = send(&h.router, "GET", "/api/v1/jobs?view=history", None).await;
        assert_eq!(history["job_executions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_project_vault_test_requires_binding() {
        let h = harness().await;
        let (_, projects) = send(&h.router, "GET", "/api/v1/projects", None).await;
        let project_id = projects["projects"][0]["id"].to_string();

        let (status, body) = send(
            &h.router,
            "POST",
            &format!("/api/v1/projects/{project_id}/vault-test"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "project has no vault connection");

        let (status, _) = send(
            &h.router,
            "PUT",
            &format!("/api/v1/projects/{project_id}/vault"),
            Some(json!({"connection": "missing", "secrets": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
