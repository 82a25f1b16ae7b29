//! Errors raised while talking to git.

use ciwi_core::Error;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git operations timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("invalid file path {0:?}: must be relative and stay inside the repository")]
    InvalidPath(String),

    #[error("read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("version file {path} contains {value:?}, expected MAJOR.MINOR.PATCH")]
    InvalidVersion { path: String, value: String },

    #[error("invalid git ref {0:?}")]
    InvalidRef(String),

    #[error("repository url is required")]
    MissingRepo,

    #[error("temporary checkout directory: {0}")]
    TempDir(#[source] std::io::Error),
}

impl From<GitError> for Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::MissingRepo | GitError::InvalidRef(_) | GitError::InvalidPath(_) => {
                Error::invalid(err.to_string())
            }
            _ => Error::upstream(err.to_string()),
        }
    }
}
