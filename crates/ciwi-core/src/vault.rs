//! Vault connection and secret reference types.

use crate::ids::VaultConnectionId;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*secret\.([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
});

/// True if `value` contains at least one `{{ secret.<name> }}` placeholder.
pub fn contains_placeholder(value: &str) -> bool {
    PLACEHOLDER.is_match(value)
}

/// Secret names referenced by placeholders in `value`, in order of appearance.
pub fn placeholder_names(value: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(value)
        .map(|c| c[1].to_string())
        .collect()
}

/// Replace every placeholder whose name is in `resolved`. Unknown names are
/// left untouched.
pub fn substitute_placeholders(value: &str, resolved: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(value, |caps: &regex::Captures<'_>| {
            resolved
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Authentication method used against the secret service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Approle,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Approle => "approle",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "approle" => Some(AuthMethod::Approle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConnection {
    pub id: VaultConnectionId,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    /// Mount path of the AppRole auth backend.
    #[serde(default = "default_approle_mount")]
    pub approle_mount: String,
    #[serde(default)]
    pub role_id: String,
    /// Environment variable holding the AppRole secret id.
    #[serde(default)]
    pub secret_id_env: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_kv_mount")]
    pub kv_default_mount: String,
    #[serde(default = "default_kv_version")]
    pub kv_default_version: u8,
    pub updated_utc: DateTime<Utc>,
}

/// Payload for creating or replacing a connection by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertVaultConnection {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default = "default_approle_mount")]
    pub approle_mount: String,
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub secret_id_env: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_kv_mount")]
    pub kv_default_mount: String,
    #[serde(default = "default_kv_version")]
    pub kv_default_version: u8,
}

impl UpsertVaultConnection {
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::invalid("vault connection name is required"));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(crate::Error::invalid(format!(
                "vault connection url {:?} must be http or https",
                self.url
            )));
        }
        if self.role_id.trim().is_empty() {
            return Err(crate::Error::invalid("vault connection role_id is required"));
        }
        if self.secret_id_env.trim().is_empty() {
            return Err(crate::Error::invalid(
                "vault connection secret_id_env is required",
            ));
        }
        if !matches!(self.kv_default_version, 1 | 2) {
            return Err(crate::Error::invalid("vault kv version must be 1 or 2"));
        }
        Ok(())
    }
}

fn default_approle_mount() -> String {
    "approle".to_string()
}

fn default_kv_mount() -> String {
    "secret".to_string()
}

fn default_kv_version() -> u8 {
    2
}

/// A named reference to one key of one secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    pub path: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kv_version: Option<u8>,
}

impl SecretRef {
    pub fn mount_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.mount
            .as_deref()
            .map(|m| m.trim_matches('/'))
            .filter(|m| !m.is_empty())
            .unwrap_or(default)
    }

    pub fn kv_version_or(&self, default: u8) -> u8 {
        self.kv_version.unwrap_or(default)
    }
}

/// Result of probing one connection or one secret, without values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultProbe {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert() -> UpsertVaultConnection {
        UpsertVaultConnection {
            name: "home".into(),
            url: "https://vault.local:8200".into(),
            auth_method: AuthMethod::Approle,
            approle_mount: default_approle_mount(),
            role_id: "role".into(),
            secret_id_env: "CIWI_VAULT_SECRET_ID".into(),
            namespace: None,
            kv_default_mount: default_kv_mount(),
            kv_default_version: 2,
        }
    }

    #[test]
    fn test_validate_connection() {
        assert!(upsert().validate().is_ok());
        let mut bad = upsert();
        bad.url = "vault.local".into();
        assert!(bad.validate().is_err());
        let mut bad = upsert();
        bad.kv_default_version = 3;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_secret_ref_defaults() {
        let secret: SecretRef =
            serde_json::from_str(r#"{"name":"gh","path":"ci/github","key":"token"}"#).unwrap();
        assert_eq!(secret.mount_or("secret"), "secret");
        assert_eq!(secret.kv_version_or(2), 2);
    }

    #[test]
    fn test_placeholders() {
        let value = "token={{ secret.github-token }} other={{secret.npm}}";
        assert!(contains_placeholder(value));
        assert_eq!(placeholder_names(value), vec!["github-token", "npm"]);
        let resolved = HashMap::from([("github-token".to_string(), "abc".to_string())]);
        assert_eq!(
            substitute_placeholders(value, &resolved),
            "token=abc other={{secret.npm}}"
        );
        assert!(!contains_placeholder("{{ env.HOME }}"));
    }

    #[test]
    fn test_auth_method_parse() {
        assert_eq!(AuthMethod::parse("AppRole"), Some(AuthMethod::Approle));
        assert_eq!(AuthMethod::parse("token"), None);
    }
}
