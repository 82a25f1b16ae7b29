//! HTTP client for the secret service: AppRole login and KV reads.

use crate::error::VaultError;
use ciwi_core::ids::VaultConnectionId;
use ciwi_core::vault::{SecretRef, VaultConnection};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_VAULT_DEADLINE: Duration = Duration::from_secs(20);

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Where AppRole secret ids come from.
#[derive(Debug, Clone, Default)]
pub enum SecretIdSource {
    /// Read the variable named by the connection from the process environment.
    #[default]
    Env,
    /// Fixed variable-to-value map.
    Fixed(HashMap<String, String>),
}

impl SecretIdSource {
    fn lookup(&self, var: &str) -> Option<String> {
        let value = match self {
            SecretIdSource::Env => std::env::var(var).ok(),
            SecretIdSource::Fixed(map) => map.get(var).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

struct CachedToken {
    token: String,
    /// `None` for tokens without a lease.
    refresh_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.refresh_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

/// Logs in with AppRole and reads KV secrets.
///
/// Tokens are cached per connection id and reused until 80% of their lease
/// has passed.
pub struct VaultClient {
    http: reqwest::Client,
    secret_ids: SecretIdSource,
    tokens: RwLock<HashMap<VaultConnectionId, CachedToken>>,
}

impl VaultClient {
    pub fn new(deadline: Duration) -> Result<Self, VaultError> {
        let http = reqwest::Client::builder().timeout(deadline).build()?;
        Ok(Self {
            http,
            secret_ids: SecretIdSource::Env,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_secret_ids(mut self, secret_ids: SecretIdSource) -> Self {
        self.secret_ids = secret_ids;
        self
    }

    /// A token for `conn`, from the cache or a fresh login.
    pub async fn token(&self, conn: &VaultConnection) -> Result<String, VaultError> {
        if let Some(cached) = self.tokens.read().await.get(&conn.id)
            && cached.is_fresh()
        {
            return Ok(cached.token.clone());
        }

        let cached = self.login(conn).await?;
        let token = cached.token.clone();
        self.tokens.write().await.insert(conn.id, cached);
        Ok(token)
    }

    async fn login(&self, conn: &VaultConnection) -> Result<CachedToken, VaultError> {
        let secret_id = self
            .secret_ids
            .lookup(&conn.secret_id_env)
            .ok_or_else(|| VaultError::MissingSecretId(conn.secret_id_env.clone()))?;
        let url = format!(
            "{}/v1/auth/{}/login",
            base_url(conn),
            conn.approle_mount.trim_matches('/')
        );
        let body = serde_json::json!({
            "role_id": conn.role_id,
            "secret_id": secret_id,
        });

        let response = with_namespace(self.http.post(&url), conn)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "login").await?;
        let login: LoginResponse = response.json().await?;
        let auth = login
            .auth
            .filter(|a| !a.client_token.is_empty())
            .ok_or(VaultError::NoToken)?;

        debug!(
            vault_connection = %conn.name,
            lease_secs = auth.lease_duration,
            "logged in to vault"
        );
        let refresh_at = (auth.lease_duration > 0)
            .then(|| Instant::now() + Duration::from_secs(auth.lease_duration) * 4 / 5);
        Ok(CachedToken {
            token: auth.client_token,
            refresh_at,
        })
    }

    /// Read the value of one secret reference.
    pub async fn read_secret(
        &self,
        conn: &VaultConnection,
        secret: &SecretRef,
    ) -> Result<String, VaultError> {
        let token = self.token(conn).await?;
        let mount = secret.mount_or(&conn.kv_default_mount).trim_matches('/');
        let path = secret.path.trim_matches('/');
        let v2 = secret.kv_version_or(conn.kv_default_version) == 2;
        let url = if v2 {
            format!("{}/v1/{mount}/data/{path}", base_url(conn))
        } else {
            format!("{}/v1/{mount}/{path}", base_url(conn))
        };

        let response = with_namespace(self.http.get(&url), conn)
            .header(TOKEN_HEADER, &token)
            .send()
            .await?;
        if response.status() == StatusCode::FORBIDDEN {
            warn!(vault_connection = %conn.name, "vault rejected cached token");
            self.evict(conn.id).await;
        }
        let response = check_status(response, "read").await?;
        let body: Value = response.json().await?;

        let data = if v2 {
            &body["data"]["data"]
        } else {
            &body["data"]
        };
        let display_path = format!("{mount}/{path}");
        match &data[secret.key.as_str()] {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Err(VaultError::MissingKey {
                path: display_path,
                key: secret.key.clone(),
            }),
            other => Ok(other.to_string()),
        }
    }

    /// Drop the cached token of a connection.
    pub async fn evict(&self, id: VaultConnectionId) {
        self.tokens.write().await.remove(&id);
    }

    pub async fn cached_tokens(&self) -> usize {
        self.tokens.read().await.len()
    }
}

fn base_url(conn: &VaultConnection) -> &str {
    conn.url.trim_end_matches('/')
}

fn with_namespace(request: RequestBuilder, conn: &VaultConnection) -> RequestBuilder {
    match conn.namespace.as_deref().map(str::trim) {
        Some(ns) if !ns.is_empty() => request.header(NAMESPACE_HEADER, ns),
        _ => request,
    }
}

async fn check_status(response: Response, operation: &'static str) -> Result<Response, VaultError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v["errors"].as_array().map(|errors| {
                errors
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("; ")
            })
        })
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    Err(VaultError::Status {
        operation,
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use ciwi_core::vault::AuthMethod;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn connection(url: &str) -> VaultConnection {
        VaultConnection {
            id: VaultConnectionId(1),
            name: "main".into(),
            url: url.to_string(),
            auth_method: AuthMethod::Approle,
            approle_mount: "approle".into(),
            role_id: "role-1".into(),
            secret_id_env: "CIWI_TEST_SECRET_ID".into(),
            namespace: None,
            kv_default_mount: "secret".into(),
            kv_default_version: 2,
            updated_utc: Utc::now(),
        }
    }

    pub(crate) fn client() -> VaultClient {
        VaultClient::new(DEFAULT_VAULT_DEADLINE)
            .unwrap()
            .with_secret_ids(SecretIdSource::Fixed(HashMap::from([(
                "CIWI_TEST_SECRET_ID".to_string(),
                "secret-1".to_string(),
            )])))
    }

    pub(crate) async fn mount_login(server: &MockServer, lease: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .and(body_json(serde_json::json!({
                "role_id": "role-1",
                "secret_id": "secret-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "auth": { "client_token": "tok-1", "lease_duration": lease }
            })))
            .mount(server)
            .await;
    }

    fn secret(key: &str, kv_version: Option<u8>) -> SecretRef {
        SecretRef {
            name: "token".into(),
            mount: None,
            path: "ci/github".into(),
            key: key.into(),
            kv_version,
        }
    }

    #[tokio::test]
    async fn test_kv2_read_caches_token() {
        let server = MockServer::start().await;
        mount_login(&server, 3600).await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .and(header(TOKEN_HEADER, "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "token": "ghp_abc" }, "metadata": { "version": 3 } }
            })))
            .mount(&server)
            .await;

        let client = client();
        let conn = connection(&server.uri());
        assert_eq!(client.read_secret(&conn, &secret("token", None)).await.unwrap(), "ghp_abc");
        assert_eq!(client.read_secret(&conn, &secret("token", None)).await.unwrap(), "ghp_abc");

        let logins = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/v1/auth/approle/login")
            .count();
        assert_eq!(logins, 1);
        assert_eq!(client.cached_tokens().await, 1);
    }

    #[tokio::test]
    async fn test_kv1_read_with_namespace() {
        let server = MockServer::start().await;
        mount_login(&server, 60).await;
        Mock::given(method("GET"))
            .and(path("/v1/kv/ci/github"))
            .and(header(NAMESPACE_HEADER, "team-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "token": "v1-value", "port": 8200 }
            })))
            .mount(&server)
            .await;

        let client = client();
        let mut conn = connection(&server.uri());
        conn.namespace = Some("team-a".into());
        conn.kv_default_mount = "kv".into();
        conn.kv_default_version = 1;

        assert_eq!(client.read_secret(&conn, &secret("token", None)).await.unwrap(), "v1-value");
        assert_eq!(client.read_secret(&conn, &secret("port", None)).await.unwrap(), "8200");
        let err = client.read_secret(&conn, &secret("missing", None)).await.unwrap_err();
        assert_eq!(err.to_string(), "vault secret kv/ci/github has no key \"missing\"");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/approle/login"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "errors": ["invalid role or secret ID"]
            })))
            .mount(&server)
            .await;

        let err = client().token(&connection(&server.uri())).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "vault login returned 400: invalid role or secret ID"
        );
    }

    #[tokio::test]
    async fn test_missing_secret_id_env() {
        let client = VaultClient::new(DEFAULT_VAULT_DEADLINE)
            .unwrap()
            .with_secret_ids(SecretIdSource::Fixed(HashMap::new()));
        let err = client.token(&connection("http://127.0.0.1:1")).await.unwrap_err();
        assert!(matches!(err, VaultError::MissingSecretId(_)));
    }

    #[tokio::test]
    async fn test_forbidden_read_evicts_token() {
        let server = MockServer::start().await;
        mount_login(&server, 3600).await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "errors": ["permission denied"]
            })))
            .mount(&server)
            .await;

        let client = client();
        let err = client
            .read_secret(&connection(&server.uri()), &secret("token", None))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "vault read returned 403: permission denied");
        assert_eq!(client.cached_tokens().await, 0);
    }
}
