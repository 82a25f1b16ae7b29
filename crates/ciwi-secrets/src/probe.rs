//! Connectivity checks that never expose secret values.

use crate::client::VaultClient;
use ciwi_core::vault::{SecretRef, VaultConnection, VaultProbe};
use tracing::info;

/// Log in with `conn` and report whether it worked.
pub async fn probe_connection(client: &VaultClient, conn: &VaultConnection) -> VaultProbe {
    client.evict(conn.id).await;
    let result = client.token(conn).await;
    info!(vault_connection = %conn.name, ok = result.is_ok(), "tested vault connection");
    match result {
        Ok(_) => VaultProbe {
            name: conn.name.clone(),
            ok: true,
            message: Some("login succeeded".into()),
        },
        Err(e) => VaultProbe {
            name: conn.name.clone(),
            ok: false,
            message: Some(e.to_string()),
        },
    }
}

/// Read every secret and report per-secret success.
pub async fn probe_secrets(
    client: &VaultClient,
    conn: &VaultConnection,
    secrets: &[SecretRef],
) -> Vec<VaultProbe> {
    let mut probes = Vec::with_capacity(secrets.len());
    for secret in secrets {
        let probe = match client.read_secret(conn, secret).await {
            Ok(value) if value.is_empty() => VaultProbe {
                name: secret.name.clone(),
                ok: false,
                message: Some("secret is empty".into()),
            },
            Ok(_) => VaultProbe {
                name: secret.name.clone(),
                ok: true,
                message: None,
            },
            Err(e) => VaultProbe {
                name: secret.name.clone(),
                ok: false,
                message: Some(e.to_string()),
            },
        };
        probes.push(probe);
    }
    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client, connection, mount_login};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_probe_reports_without_values() {
        let server = MockServer::start().await;
        mount_login(&server, 3600).await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/github"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "data": { "token": "ghp_abc" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/ci/npm"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errors": []
            })))
            .mount(&server)
            .await;

        let client = client();
        let conn = connection(&server.uri());
        assert!(probe_connection(&client, &conn).await.ok);

        let secrets = vec![
            SecretRef {
                name: "gh".into(),
                mount: None,
                path: "ci/github".into(),
                key: "token".into(),
                kv_version: None,
            },
            SecretRef {
                name: "npm".into(),
                mount: None,
                path: "ci/npm".into(),
                key: "token".into(),
                kv_version: None,
            },
        ];
        let probes = probe_secrets(&client, &conn, &secrets).await;
        assert!(probes[0].ok);
        assert_eq!(probes[0].message, None);
        assert!(!probes[1].ok);
        assert_eq!(
            probes[1].message.as_deref(),
            Some("vault read returned 404: Not Found")
        );
    }
}
