//! Source repository operations consumed by expansion and project import.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static COMMIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").expect("commit sha regex is valid"));

static PLAIN_SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("semver regex is valid")
});

/// Sub-steps reported while resolving a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveStep {
    Checkout,
    VersionFile,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveStatus {
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveEvent {
    pub step: ResolveStep,
    pub status: ResolveStatus,
    pub message: String,
}

impl ResolveEvent {
    pub fn new(step: ResolveStep, status: ResolveStatus, message: impl Into<String>) -> Self {
        Self {
            step,
            status,
            message: message.into(),
        }
    }
}

/// Callback invoked for every resolve sub-step.
pub type ReportFn<'a> = &'a (dyn Fn(ResolveEvent) + Send + Sync);

/// Reporter that discards events.
pub fn no_report(_: ResolveEvent) {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRequest {
    pub repo_url: String,
    pub git_ref: String,
    pub version_file: String,
    pub tag_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedVersion {
    /// Content of the version file, e.g. `1.4.0`.
    pub raw: String,
    /// `tag_prefix + raw`, e.g. `v1.4.0`.
    pub tagged: String,
    pub tag_prefix: String,
    /// Commit checked out when the file was read.
    pub source_ref_resolved: String,
}

impl ResolvedVersion {
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl fmt::Display for ResolvedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tagged)
    }
}

/// A file read from a repository at a ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub content: String,
    pub commit: String,
}

/// True for a full 40-character hexadecimal commit id.
pub fn is_commit_sha(value: &str) -> bool {
    COMMIT_SHA.is_match(value)
}

/// True for a plain `MAJOR.MINOR.PATCH` version.
pub fn is_plain_semver(value: &str) -> bool {
    PLAIN_SEMVER.is_match(value)
}
