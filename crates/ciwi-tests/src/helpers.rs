//! Fakes and server helpers.

use async_trait::async_trait;
use ciwi_api::{AppState, create_router};
use ciwi_core::ports::{SecretResolution, SourceRepository, StepSecretResolver};
use ciwi_core::job::JobExecution;
use ciwi_core::source::{
    FetchedFile, ReportFn, ResolveEvent, ResolveStatus, ResolveStep, ResolvedVersion,
    VersionRequest,
};
use ciwi_core::{Error, Result};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Source repository answering from a script instead of git.
///
/// Every resolve returns the configured version, or fails with the
/// configured error.
pub struct ScriptedSource {
    version: Mutex<std::result::Result<String, String>>,
    commit: String,
    requests: Mutex<Vec<VersionRequest>>,
}

impl ScriptedSource {
    pub fn new(version: &str) -> Self {
        Self {
            version: Mutex::new(Ok(version.to_string())),
            commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_version(&self, version: &str) {
        if let Ok(mut v) = self.version.lock() {
            *v = Ok(version.to_string());
        }
    }

    pub fn fail_with(&self, message: &str) {
        if let Ok(mut v) = self.version.lock() {
            *v = Err(message.to_string());
        }
    }

    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn requests(&self) -> Vec<VersionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SourceRepository for ScriptedSource {
    async fn resolve_version(
        &self,
        request: &VersionRequest,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self
            .version
            .lock()
            .map_err(|_| Error::Internal("scripted source poisoned".into()))?
            .clone();

        report(ResolveEvent::new(ResolveStep::Checkout, ResolveStatus::Running, &request.repo_url));
        report(ResolveEvent::new(ResolveStep::Checkout, ResolveStatus::Ok, &self.commit));
        match scripted {
            Ok(raw) => {
                report(ResolveEvent::new(
                    ResolveStep::VersionFile,
                    ResolveStatus::Ok,
                    &request.version_file,
                ));
                report(ResolveEvent::new(ResolveStep::Version, ResolveStatus::Ok, &raw));
                Ok(ResolvedVersion {
                    tagged: format!("{}{raw}", request.tag_prefix),
                    raw,
                    tag_prefix: request.tag_prefix.clone(),
                    source_ref_resolved: self.commit.clone(),
                })
            }
            Err(message) => {
                report(ResolveEvent::new(
                    ResolveStep::VersionFile,
                    ResolveStatus::Error,
                    &message,
                ));
                Err(Error::upstream(message))
            }
        }
    }

    async fn read_file(&self, repo_url: &str, _: &str, path: &str) -> Result<FetchedFile> {
        Err(Error::upstream(format!("{repo_url}: {path} is not scripted")))
    }
}

/// Resolver for stores without vault connections; it passes the plan through.
pub struct PassthroughSecrets;

#[async_trait]
impl StepSecretResolver for PassthroughSecrets {
    async fn resolve(&self, job: &JobExecution) -> Result<SecretResolution> {
        Ok(SecretResolution {
            step_plan: job.step_plan.clone(),
            sensitive_values: Vec::new(),
            resolved_steps: 0,
        })
    }
}

/// Serve the API on an ephemeral port and return its address.
pub async fn start_test_server(
    state: Arc<AppState>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "test server failed");
        }
    });

    Ok((addr, handle))
}

/// Thin HTTP client bound to one test server.
pub struct ApiTestClient {
    client: Client,
    base_url: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: Client::new(),
            base_url: format!("http://{addr}"),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(self.url(path)).send().await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).json(body).send().await
    }

    pub async fn delete(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.delete(self.url(path)).send().await
    }

    pub async fn health(&self) -> anyhow::Result<bool> {
        let resp = self.get("/healthz").await?;
        Ok(resp.status().is_success())
    }
}
