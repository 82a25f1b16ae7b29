//! Artifacts and test reports attached to job executions.

use crate::ids::JobExecutionId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_execution_id: JobExecutionId,
    /// Forward-slash path relative to the job's artifact directory.
    pub path: String,
    pub size_bytes: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl Artifact {
    pub fn url_for(job_id: &JobExecutionId, path: &str) -> String {
        format!("/artifacts/{job_id}/{path}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUpload {
    pub path: String,
    pub data_base64: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadArtifactsRequest {
    pub agent_id: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactUpload>,
}

/// Validate and normalise an artifact path.
///
/// Backslashes are treated as separators. Absolute paths, drive prefixes and
/// `..` components are rejected; `.` and empty components are dropped.
pub fn validate_artifact_path(raw: &str) -> Result<String> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(Error::invalid("artifact path is required"));
    }
    if unified.starts_with('/') || unified.as_bytes().get(1) == Some(&b':') {
        return Err(Error::invalid(format!("artifact path {raw:?} must be relative")));
    }
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::invalid(format!(
                    "artifact path {raw:?} must not contain '..'"
                )));
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(Error::invalid(format!("artifact path {raw:?} is empty")));
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suites: Vec<TestSuite>,
}

impl TestReport {
    pub fn validate(&self) -> Result<()> {
        if self.passed + self.failed + self.skipped > self.total {
            return Err(Error::invalid(
                "test report counts exceed the reported total",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTestReportRequest {
    pub agent_id: String,
    pub report: TestReport,
}

/// Stored test report with its owning execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTestReport {
    pub job_execution_id: JobExecutionId,
    pub report: TestReport,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths_are_normalised() {
        assert_eq!(validate_artifact_path("dist/app.tar.gz").unwrap(), "dist/app.tar.gz");
        assert_eq!(validate_artifact_path("./dist//bin\\app").unwrap(), "dist/bin/app");
    }

    #[test]
    fn test_rejected_paths() {
        for bad in ["", "/etc/passwd", "C:/x", "dist/../../etc", "..", "./"] {
            assert!(validate_artifact_path(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_report_counts() {
        let report = TestReport {
            total: 3,
            passed: 2,
            failed: 1,
            skipped: 1,
            suites: Vec::new(),
        };
        assert!(report.validate().is_err());
    }
}
