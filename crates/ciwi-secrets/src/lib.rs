//! Vault (AppRole + KV) access for the ciwi CI server.
//!
//! [`VaultClient`] logs in and reads secrets; [`VaultSecretResolver`] uses it
//! to fill `{{ secret.<name> }}` placeholders in step plans at lease time.

mod client;
mod error;
mod probe;
mod resolver;

pub use client::{DEFAULT_VAULT_DEADLINE, SecretIdSource, VaultClient};
pub use error::VaultError;
pub use probe::{probe_connection, probe_secrets};
pub use resolver::VaultSecretResolver;
