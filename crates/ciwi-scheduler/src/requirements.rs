//! Required-capability assembly for pending jobs.

use ciwi_core::capability::{
    CapabilityMap, KEY_AGENT_ID, REQUIRES_CONTAINER_TOOL_PREFIX, REQUIRES_TOOL_PREFIX,
};
use ciwi_core::config::JobSpec;
use ciwi_core::metadata::{CONTAINER_PREFIX, Metadata};
use ciwi_core::{Error, Result};

/// Capabilities an agent must advertise plus the container hints that are
/// left for agent-side probing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequirements {
    pub capabilities: CapabilityMap,
    pub container_metadata: Metadata,
}

/// Build the required-capabilities map of a job.
///
/// `runs_on` is the base; `container.*` keys move to metadata. Tool
/// constraints become `requires.tool.<name>` and
/// `requires.container.tool.<name>` entries. A pinned agent adds `agent_id`.
pub fn assemble_requirements(job: &JobSpec, pinned_agent: Option<&str>) -> Result<JobRequirements> {
    let mut reqs = JobRequirements::default();
    for (key, value) in &job.runs_on {
        if key.starts_with(CONTAINER_PREFIX) {
            reqs.container_metadata.insert(key.clone(), value.clone());
        } else {
            reqs.capabilities.insert(key.clone(), value.clone());
        }
    }
    for (tool, constraint) in &job.requires.tools {
        reqs.capabilities
            .insert(format!("{REQUIRES_TOOL_PREFIX}{tool}"), constraint.trim().to_string());
    }
    for (tool, constraint) in &job.requires.container.tools {
        reqs.capabilities.insert(
            format!("{REQUIRES_CONTAINER_TOOL_PREFIX}{tool}"),
            constraint.trim().to_string(),
        );
    }

    if let Some(agent) = pinned_agent.map(str::trim).filter(|a| !a.is_empty()) {
        match reqs.capabilities.get(KEY_AGENT_ID) {
            Some(existing) if existing != agent => {
                return Err(Error::constraint(format!(
                    "job {:?} is pinned to agent {existing:?}, cannot run on {agent:?}",
                    job.id
                )));
            }
            _ => {
                reqs.capabilities
                    .insert(KEY_AGENT_ID.to_string(), agent.to_string());
            }
        }
    }
    Ok(reqs)
}
