//! Ad-hoc script runs pinned to one agent.

use crate::config::SchedulerConfig;
use ciwi_core::capability::{CapabilityMap, KEY_AGENT_ID, KEY_SHELL};
use ciwi_core::job::{CreateJobExecution, StepKind, StepPlanItem, script_from_plan};
use ciwi_core::metadata::{self, FLAG_SET, Metadata};
use ciwi_core::{Error, Result};
use std::collections::BTreeMap;

/// Shell used when neither the request nor the agent names one.
pub const DEFAULT_SHELL: &str = "posix";

/// Build the single execution of an ad-hoc run.
///
/// A missing or zero timeout takes the configured default; larger values
/// are capped at the configured maximum.
pub fn build_adhoc_job(
    agent_id: &str,
    script: &str,
    shell: &str,
    timeout_seconds: Option<u64>,
    config: &SchedulerConfig,
) -> Result<CreateJobExecution> {
    let agent_id = agent_id.trim();
    if agent_id.is_empty() {
        return Err(Error::invalid("agent_id is required"));
    }
    if script.trim().is_empty() {
        return Err(Error::invalid("adhoc script is required"));
    }
    let shell = Some(shell.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SHELL);
    let timeout_seconds = timeout_seconds
        .filter(|t| *t > 0)
        .unwrap_or(config.adhoc_default_timeout_secs)
        .min(config.adhoc_max_timeout_secs);

    let step_plan = vec![StepPlanItem {
        index: 0,
        name: "adhoc".to_string(),
        kind: StepKind::Run {
            script: script.to_string(),
        },
        env: BTreeMap::new(),
        vault_connection: None,
        secrets: Vec::new(),
    }];

    Ok(CreateJobExecution {
        script: script_from_plan(&step_plan),
        required_capabilities: CapabilityMap::from([
            (KEY_AGENT_ID.to_string(), agent_id.to_string()),
            (KEY_SHELL.to_string(), shell.to_string()),
        ]),
        timeout_seconds,
        step_plan,
        metadata: Metadata::from([
            (metadata::ADHOC.to_string(), FLAG_SET.to_string()),
            (metadata::ADHOC_AGENT_ID.to_string(), agent_id.to_string()),
        ]),
        env: BTreeMap::from([("CIWI_ADHOC".to_string(), FLAG_SET.to_string())]),
        ..Default::default()
    })
}
