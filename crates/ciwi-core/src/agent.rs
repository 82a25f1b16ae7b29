//! Agent types.

use crate::capability::CapabilityMap;
use crate::ids::JobExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An execution agent as known to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: CapabilityMap,
    pub last_seen_utc: DateTime<Utc>,
    #[serde(default)]
    pub deactivated: bool,
    #[serde(default)]
    pub update: UpdateState,
}

/// Per-agent update rollout bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateState {
    /// Target the bookkeeping below refers to.
    #[serde(default)]
    pub target: String,
    /// When this agent was first seen lagging behind `target`.
    #[serde(default)]
    pub first_seen_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_request_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    /// Set while an update is due but the agent is running a job.
    #[serde(default)]
    pub pending_busy: bool,
}

/// Actions an operator can queue for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    Update,
    RefreshTools,
    Restart,
    RunAdhoc {
        script: String,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: CapabilityMap,
    #[serde(default)]
    pub timestamp_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub update_requested: bool,
    #[serde(default)]
    pub update_target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub refresh_tools_requested: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub restart_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: CapabilityMap,
}

/// Agent view returned by listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub update_requested: bool,
    pub refresh_tools_pending: u32,
    pub restart_pending: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_adhoc_job: Option<JobExecutionId>,
}
