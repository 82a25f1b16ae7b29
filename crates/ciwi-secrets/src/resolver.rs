//! Lease-time substitution of secret placeholders in step plans.

use crate::client::VaultClient;
use crate::error::VaultError;
use async_trait::async_trait;
use ciwi_core::Result;
use ciwi_core::job::JobExecution;
use ciwi_core::ports::{SecretResolution, StepSecretResolver, VaultRepository};
use ciwi_core::vault::{
    SecretRef, VaultConnection, contains_placeholder, placeholder_names, substitute_placeholders,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// [`StepSecretResolver`] backed by the configured vault connections.
pub struct VaultSecretResolver {
    vaults: Arc<dyn VaultRepository>,
    client: Arc<VaultClient>,
}

impl VaultSecretResolver {
    pub fn new(vaults: Arc<dyn VaultRepository>, client: Arc<VaultClient>) -> Self {
        Self { vaults, client }
    }

    async fn connection<'a>(
        &self,
        cache: &'a mut HashMap<String, VaultConnection>,
        name: &str,
    ) -> Result<&'a VaultConnection> {
        if !cache.contains_key(name) {
            let conn = self
                .vaults
                .get_by_name(name)
                .await?
                .ok_or_else(|| VaultError::UnknownConnection(name.to_string()))?;
            cache.insert(name.to_string(), conn);
        }
        cache
            .get(name)
            .ok_or_else(|| VaultError::UnknownConnection(name.to_string()).into())
    }
}

#[async_trait]
impl StepSecretResolver for VaultSecretResolver {
    async fn resolve(&self, job: &JobExecution) -> Result<SecretResolution> {
        if job.env.values().any(|v| contains_placeholder(v)) {
            return Err(VaultError::ExecutionEnvPlaceholder.into());
        }

        let mut connections = HashMap::new();
        let mut step_plan = job.step_plan.clone();
        let mut sensitive_values: Vec<String> = Vec::new();
        let mut resolved_steps = 0;

        for step in &mut step_plan {
            if !step.needs_secret_resolution() {
                continue;
            }
            let conn_name = step.vault_connection.as_deref().unwrap_or_default().trim();
            let conn = self.connection(&mut connections, conn_name).await?;

            let mut values: HashMap<String, String> = HashMap::new();
            for name in step.env.values().flat_map(|v| placeholder_names(v)) {
                if values.contains_key(&name) {
                    continue;
                }
                let secret = binding(&step.secrets, &name).ok_or_else(|| {
                    VaultError::UnboundSecret {
                        step: step.name.clone(),
                        name: name.clone(),
                    }
                })?;
                let value = self.client.read_secret(conn, secret).await?;
                if value.is_empty() {
                    return Err(VaultError::EmptySecret { name }.into());
                }
                if !sensitive_values.contains(&value) {
                    sensitive_values.push(value.clone());
                }
                values.insert(name, value);
            }

            for value in step.env.values_mut() {
                *value = substitute_placeholders(value, &values);
            }
            resolved_steps += 1;
            debug!(
                job_execution_id = %job.id,
                step = %step.name,
                vault_connection = %conn.name,
                secrets = values.len(),
                "resolved step secrets"
            );
        }

        Ok(SecretResolution {
            step_plan,
            sensitive_values,
            resolved_steps,
        })
    }
}

fn binding<'a>(secrets: &'a [SecretRef], name: &str) -> Option<&'a SecretRef> {
    secrets.iter().find(|s| s.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client, connection, mount_login};
    use chrono::{DateTime, Utc};
    use ciwi_core::ids::{JobExecutionId, VaultConnectionId};
    use ciwi_core::job::{JobExecutionStatus, StepKind, StepPlanItem};
    use ciwi_core::vault::UpsertVaultConnection;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct OneConnection(VaultConnection);

    #[async_trait]
    impl VaultRepository for OneConnection {
        async fn list(&self) -> Result<Vec<VaultConnection>> {
            Ok(vec![self.0.clone()])
        }

        async fn get(&self, id: VaultConnectionId) -> Result<Option<VaultConnection>> {
            Ok((id == self.0.id).then(|| self.0.clone()))
        }

        async fn get_by_name(&self, name: &str) -> Result<Option<VaultConnection>> {
            Ok((name == self.0.name).then(|| self.0.clone()))
        }

        async fn upsert(
            &self,
            _: &UpsertVaultConnection,
            _: DateTime<Utc>,
        ) -> Result<VaultConnection> {
            Ok(self.0.clone())
        }

        async fn delete(&self, _: VaultConnectionId) -> Result<()> {
            Ok(())
        }
    }

    fn step(name: &str, env: &[(&str, &str)], connection: Option<&str>) -> StepPlanItem {
        StepPlanItem {
            index: 0,
            name: name.into(),
            kind: StepKind::Run {
                script: "./publish.sh".into(),
            },
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            vault_connection: connection.map(str::to_string),
            secrets: vec![SecretRef {
                name: "gh".into(),
                mount: None,
                path: "ci/github".into(),
                key: "token".into(),
                kv_version: None,
            }],
        }
    }

    fn job(step_plan: Vec<StepPlanItem>, env: BTreeMap<String, String>) -> JobExecution {
        JobExecution {
            id: JobExecutionId::new(),
            script: String::new(),
            env,
            required_capabilities: Default::default(),
            timeout_seconds: 60,
            artifact_globs: vec![],
            caches: vec![],
            source: None,
            step_plan,
            metadata: Default::default(),
            current_step: String::new(),
            status: JobExecutionStatus::Leased,
            created_utc: Utc::now(),
            started_utc: None,
            finished_utc: None,
            leased_by_agent_id: Some("agent-1".into()),
            leased_utc: Some(Utc::now()),
            exit_code: None,
            error: None,
            output: String::new(),
            sensitive_values: vec![],
        }
    }

    async fn resolver(body: serde_json::Value) -> (VaultSecretResolver, MockServer) {
        let server = MockServer::start().await;
        mount_login(&server, 3600).await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        let resolver = VaultSecretResolver::new(
            Arc::new(OneConnection(connection(&server.uri()))),
            Arc::new(client()),
        );
        (resolver, server)
    }

    #[tokio::test]
    async fn test_substitutes_step_env() {
        let (resolver, _server) =
            resolver(serde_json::json!({ "data": { "data": { "token": "ghp_abc" } } })).await;
        let job = job(
            vec![
                step("build", &[("GOOS", "linux")], None),
                step(
                    "publish",
                    &[("GH_TOKEN", "{{ secret.gh }}"), ("AUTH", "Bearer {{secret.gh}}")],
                    Some("main"),
                ),
            ],
            BTreeMap::new(),
        );

        let resolution = resolver.resolve(&job).await.unwrap();
        assert_eq!(resolution.resolved_steps, 1);
        assert_eq!(resolution.sensitive_values, vec!["ghp_abc".to_string()]);
        let publish = &resolution.step_plan[1];
        assert_eq!(publish.env["GH_TOKEN"], "ghp_abc");
        assert_eq!(publish.env["AUTH"], "Bearer ghp_abc");
        assert_eq!(resolution.step_plan[0], job.step_plan[0]);
    }

    #[tokio::test]
    async fn test_execution_env_placeholder_is_rejected() {
        let (resolver, _server) =
            resolver(serde_json::json!({ "data": { "data": { "token": "x" } } })).await;
        let job = job(
            vec![],
            BTreeMap::from([("TOKEN".to_string(), "{{ secret.gh }}".to_string())]),
        );
        let err = resolver.resolve(&job).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "secret placeholders in job execution env are not supported"
        );
    }

    #[tokio::test]
    async fn test_empty_and_unbound_secrets_fail() {
        let (resolver, _server) =
            resolver(serde_json::json!({ "data": { "data": { "token": "" } } })).await;
        let empty = job(
            vec![step("publish", &[("T", "{{ secret.gh }}")], Some("main"))],
            BTreeMap::new(),
        );
        let err = resolver.resolve(&empty).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Upstream);
        assert!(err.to_string().contains("empty value"));

        let unbound = job(
            vec![step("publish", &[("T", "{{ secret.npm }}")], Some("main"))],
            BTreeMap::new(),
        );
        let err = resolver.resolve(&unbound).await.unwrap_err();
        assert!(err.to_string().contains("without a binding"));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let (resolver, _server) =
            resolver(serde_json::json!({ "data": { "data": { "token": "x" } } })).await;
        let job = job(
            vec![step("publish", &[("T", "{{ secret.gh }}")], Some("other"))],
            BTreeMap::new(),
        );
        let err = resolver.resolve(&job).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::NotFound);
    }
}
