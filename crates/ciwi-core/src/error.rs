//! Error types for ciwi.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Request errors
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    // Lifecycle errors
    #[error("{0}")]
    ConflictOwnership(String),

    #[error("job execution {0} is already terminal")]
    AlreadyTerminal(String),

    #[error("{0}")]
    ConstraintViolation(String),

    // Collaborator errors
    #[error("{0}")]
    UpstreamFailure(String),

    // Infrastructure errors
    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], used for transport mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Constraint,
    Upstream,
    Internal,
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Error::ConstraintViolation(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Error::UpstreamFailure(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ConflictOwnership(_) | Error::AlreadyTerminal(_) => ErrorKind::Conflict,
            Error::ConstraintViolation(_) => ErrorKind::Constraint,
            Error::UpstreamFailure(_) => ErrorKind::Upstream,
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidInput(format!("project config is not valid yaml: {err}"))
    }
}
