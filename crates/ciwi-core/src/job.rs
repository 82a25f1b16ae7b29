//! Job execution types and the status state machine.

use crate::capability::CapabilityMap;
use crate::config::{CacheSpec, SourceSpec};
use crate::ids::JobExecutionId;
use crate::metadata::{self, Metadata};
use crate::vault::SecretRef;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Synthetic owner used for server-initiated failures (secret errors,
/// force-fail, maintenance).
pub const SERVER_CONTROL_AGENT: &str = "server-control";
/// Synthetic owner used by the chain and `needs` runtime.
pub const SERVER_CHAIN_AGENT: &str = "server-chain";

pub fn is_synthetic_owner(agent_id: &str) -> bool {
    agent_id == SERVER_CONTROL_AGENT || agent_id == SERVER_CHAIN_AGENT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobExecutionStatus {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
}

impl JobExecutionStatus {
    pub const ALL: [JobExecutionStatus; 5] = [
        JobExecutionStatus::Queued,
        JobExecutionStatus::Leased,
        JobExecutionStatus::Running,
        JobExecutionStatus::Succeeded,
        JobExecutionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobExecutionStatus::Queued => "queued",
            JobExecutionStatus::Leased => "leased",
            JobExecutionStatus::Running => "running",
            JobExecutionStatus::Succeeded => "succeeded",
            JobExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobExecutionStatus::Succeeded | JobExecutionStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobExecutionStatus::Leased | JobExecutionStatus::Running)
    }

    /// Map a reported status string to its canonical form.
    ///
    /// Normalising an already canonical value returns it unchanged.
    pub fn normalize(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" => Ok(JobExecutionStatus::Queued),
            "leased" => Ok(JobExecutionStatus::Leased),
            "running" => Ok(JobExecutionStatus::Running),
            "succeeded" | "success" | "ok" => Ok(JobExecutionStatus::Succeeded),
            "failed" | "failure" | "error" | "cancelled" => Ok(JobExecutionStatus::Failed),
            other => Err(Error::invalid(format!("unknown job status {other:?}"))),
        }
    }

    /// Statuses an agent may report through the status endpoint.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            JobExecutionStatus::Running | JobExecutionStatus::Succeeded | JobExecutionStatus::Failed
        )
    }
}

impl fmt::Display for JobExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::normalize(s)
    }
}

/// Kind-specific part of a step plan item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Run {
        script: String,
    },
    Test {
        script: String,
        test_name: String,
        test_format: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        test_report: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coverage_format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coverage_report: Option<String>,
    },
    /// Placeholder for a step skipped because the run is a dry run.
    DryrunSkip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPlanItem {
    pub index: usize,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_connection: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretRef>,
}

impl StepPlanItem {
    pub fn script(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Run { script } | StepKind::Test { script, .. } => Some(script),
            StepKind::DryrunSkip => None,
        }
    }

    pub fn needs_secret_resolution(&self) -> bool {
        self.vault_connection
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
            && self.env.values().any(|v| crate::vault::contains_placeholder(v))
    }
}

/// Concatenate the executable steps of a plan into one script body.
pub fn script_from_plan(plan: &[StepPlanItem]) -> String {
    let mut out = String::new();
    for item in plan {
        if let Some(script) = item.script() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(script.trim_end());
        }
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub required_capabilities: CapabilityMap,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub artifact_globs: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub step_plan: Vec<StepPlanItem>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub current_step: String,
    pub status: JobExecutionStatus,
    pub created_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub finished_utc: Option<DateTime<Utc>>,
    pub leased_by_agent_id: Option<String>,
    pub leased_utc: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub sensitive_values: Vec<String>,
}

impl JobExecution {
    pub fn meta(&self, key: &str) -> Option<&str> {
        metadata::get(&self.metadata, key)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        metadata::flag(&self.metadata, key)
    }

    pub fn is_blocked(&self) -> bool {
        self.meta_flag(metadata::CHAIN_BLOCKED) || self.meta_flag(metadata::NEEDS_BLOCKED)
    }

    pub fn chain_position(&self) -> Option<u32> {
        self.meta(metadata::PIPELINE_CHAIN_POSITION)?.parse().ok()
    }

    /// Copy with secret material removed, for user-facing listings.
    pub fn redacted(mut self) -> Self {
        self.sensitive_values.clear();
        self
    }
}

/// A pending job produced by expansion, ready to be persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateJobExecution {
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub required_capabilities: CapabilityMap,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub artifact_globs: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub step_plan: Vec<StepPlanItem>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CreateJobExecution {
    pub fn validate(&self) -> Result<()> {
        if self.script.trim().is_empty() && self.step_plan.is_empty() {
            return Err(Error::invalid("job execution script is required"));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::invalid("job execution timeout_seconds must be positive"));
        }
        Ok(())
    }
}

/// Status report from an agent or a synthetic owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timestamp_utc: Option<DateTime<Utc>>,
}

impl JobStatusUpdate {
    pub fn failed_by(agent_id: &str, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: JobExecutionStatus::Failed.as_str().to_string(),
            error: Some(error.into()),
            output: None,
            current_step: None,
            exit_code: None,
            timestamp_utc: None,
        }
    }
}

/// Counts per status for the summary view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub queued: u64,
    pub leased: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobSummary {
    pub fn add(&mut self, status: JobExecutionStatus, count: u64) {
        match status {
            JobExecutionStatus::Queued => self.queued += count,
            JobExecutionStatus::Leased => self.leased += count,
            JobExecutionStatus::Running => self.running += count,
            JobExecutionStatus::Succeeded => self.succeeded += count,
            JobExecutionStatus::Failed => self.failed += count,
        }
    }
}

/// Job listing view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobView {
    #[default]
    Summary,
    Queued,
    History,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(JobExecutionStatus::normalize(" Success ").unwrap(), JobExecutionStatus::Succeeded);
        assert_eq!(JobExecutionStatus::normalize("cancelled").unwrap(), JobExecutionStatus::Failed);
        assert_eq!(JobExecutionStatus::normalize("pending").unwrap(), JobExecutionStatus::Queued);
        assert!(JobExecutionStatus::normalize("exploded").is_err());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in ["ok", "error", "running", "leased", "pending", "failure"] {
            let once = JobExecutionStatus::normalize(raw).unwrap();
            let twice = JobExecutionStatus::normalize(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_step_plan_item_json_shape() {
        let item = StepPlanItem {
            index: 0,
            name: "unit".into(),
            kind: StepKind::Test {
                script: "go test -json ./...".into(),
                test_name: "unit".into(),
                test_format: "go-test-json".into(),
                test_report: None,
                coverage_format: None,
                coverage_report: None,
            },
            env: BTreeMap::new(),
            vault_connection: None,
            secrets: Vec::new(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "test");
        assert_eq!(json["test_format"], "go-test-json");
        let skip: StepPlanItem =
            serde_json::from_str(r#"{"index":1,"name":"publish","kind":"dryrun_skip"}"#).unwrap();
        assert_eq!(skip.kind, StepKind::DryrunSkip);
        assert_eq!(skip.script(), None);
    }

    #[test]
    fn test_script_from_plan_skips_placeholders() {
        let plan = vec![
            StepPlanItem {
                index: 0,
                name: "build".into(),
                kind: StepKind::Run { script: "make\n".into() },
                env: BTreeMap::new(),
                vault_connection: None,
                secrets: Vec::new(),
            },
            StepPlanItem {
                index: 1,
                name: "publish".into(),
                kind: StepKind::DryrunSkip,
                env: BTreeMap::new(),
                vault_connection: None,
                secrets: Vec::new(),
            },
        ];
        assert_eq!(script_from_plan(&plan), "make\n");
    }
}
