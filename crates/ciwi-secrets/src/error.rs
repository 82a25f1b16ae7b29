use ciwi_core::Error;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault connection {0:?} not found")]
    UnknownConnection(String),

    #[error("environment variable {0} holding the approle secret id is not set")]
    MissingSecretId(String),

    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vault {operation} returned {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("vault login response has no client token")]
    NoToken,

    #[error("vault secret {path} has no key {key:?}")]
    MissingKey { path: String, key: String },

    #[error("vault secret {name} resolved to an empty value")]
    EmptySecret { name: String },

    #[error("step {step:?} references secret {name:?} without a binding")]
    UnboundSecret { step: String, name: String },

    #[error("secret placeholders in job execution env are not supported")]
    ExecutionEnvPlaceholder,
}

impl From<VaultError> for Error {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::UnknownConnection(_) => Error::not_found(err.to_string()),
            _ => Error::upstream(err.to_string()),
        }
    }
}
