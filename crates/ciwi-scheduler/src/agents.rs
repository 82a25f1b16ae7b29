//! Agent heartbeats, operator actions and the fleet update rollout.
//!
//! Agents live in an in-memory map guarded by one mutex. Everything that must
//! survive a restart is mirrored to app state: the last heartbeat snapshot,
//! the deactivation flag and the fleet update target. The map lock is never
//! held across an await. Snapshot writes go through a separate async lock and
//! carry a per-agent sequence number, so a slower write never replaces a
//! newer snapshot.

use crate::adhoc::{DEFAULT_SHELL, build_adhoc_job};
use crate::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use ciwi_core::agent::{
    Agent, AgentAction, AgentView, HeartbeatRequest, HeartbeatResponse, UpdateState,
};
use ciwi_core::capability::{CapabilityMap, KEY_SHELL, Version, is_older_version};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::ports::{AppStateRepository, JobExecutionRepository};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SNAPSHOT_PREFIX: &str = "agent_snapshot:";
pub const DEACTIVATED_PREFIX: &str = "agent_deactivated:";
pub const UPDATE_TARGET_KEY: &str = "agent_update_target";

pub const PENDING_BUSY_MESSAGE: &str = "pending update, agent busy";
const DEACTIVATED_MESSAGE: &str = "agent is deactivated";

/// Outcome of the update check made on each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Up to date, or no target set.
    None,
    /// Lagging, first request not due yet.
    Warmup,
    /// Lagging, waiting before asking again.
    Backoff,
    Requested,
    /// Due, but the agent is running a job.
    PendingBusy,
}

/// Deterministic delay before the first update request for an agent.
///
/// Falls in `[base, base + jitter]` and depends only on the agent id and the
/// target, so every server computes the same staircase for a fleet.
pub fn warmup_delay(agent_id: &str, target: &str, config: &SchedulerConfig) -> Duration {
    let digest = Sha256::digest(format!("{agent_id}\n{target}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let jitter = config.update_warmup_jitter.as_secs();
    let offset = u64::from_be_bytes(head) % (jitter + 1);
    config.update_warmup_base + Duration::from_secs(offset)
}

/// Delay before request `attempts + 1`, doubling from the base and capped.
pub fn backoff_delay(attempts: u32, config: &SchedulerConfig) -> Duration {
    let factor = 1u32
        .checked_shl(attempts.saturating_sub(1))
        .unwrap_or(u32::MAX);
    config
        .update_backoff_base
        .saturating_mul(factor)
        .min(config.update_backoff_max)
}

fn delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Advance the rollout bookkeeping of one agent against `target`.
pub fn decide_update(
    state: &mut UpdateState,
    agent_id: &str,
    version: &str,
    target: &str,
    busy: bool,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> UpdateDecision {
    let lagging = !target.is_empty() && is_older_version(version, target) == Some(true);
    if !lagging {
        *state = UpdateState::default();
        return UpdateDecision::None;
    }
    if state.target != target {
        *state = UpdateState {
            target: target.to_string(),
            first_seen_utc: Some(now),
            ..Default::default()
        };
    }

    let first_seen = *state.first_seen_utc.get_or_insert(now);
    let (due, waiting) = match (state.attempts, state.last_request_utc) {
        (0, _) | (_, None) => (
            first_seen + delta(warmup_delay(agent_id, target, config)),
            UpdateDecision::Warmup,
        ),
        (attempts, Some(last)) => (
            last + delta(backoff_delay(attempts, config)),
            UpdateDecision::Backoff,
        ),
    };
    if now < due {
        state.pending_busy = false;
        return waiting;
    }
    if busy {
        state.pending_busy = true;
        return UpdateDecision::PendingBusy;
    }
    state.pending_busy = false;
    state.attempts += 1;
    state.last_request_utc = Some(now);
    UpdateDecision::Requested
}

fn blank_agent(agent_id: &str, now: DateTime<Utc>) -> Agent {
    Agent {
        agent_id: agent_id.to_string(),
        hostname: String::new(),
        os: String::new(),
        arch: String::new(),
        version: String::new(),
        capabilities: CapabilityMap::new(),
        last_seen_utc: now,
        deactivated: false,
        update: UpdateState::default(),
    }
}

struct AgentEntry {
    agent: Agent,
    /// Bumped on every heartbeat; orders snapshot writes.
    seq: u64,
    refresh_tools_pending: u32,
    restart_pending: u32,
    last_adhoc_job: Option<JobExecutionId>,
}

impl AgentEntry {
    fn new(agent: Agent) -> Self {
        Self {
            agent,
            seq: 0,
            refresh_tools_pending: 0,
            restart_pending: 0,
            last_adhoc_job: None,
        }
    }

    fn view(&self, manual: bool, target: &str) -> AgentView {
        let lagging =
            !target.is_empty() && is_older_version(&self.agent.version, target) == Some(true);
        let update = &self.agent.update;
        let update_status = if update.pending_busy {
            Some(PENDING_BUSY_MESSAGE.to_string())
        } else if manual {
            Some("update requested".to_string())
        } else if lagging && update.attempts == 0 {
            Some(format!("update to {target} scheduled"))
        } else if lagging {
            Some(format!(
                "update to {target} requested ({} attempts)",
                update.attempts
            ))
        } else {
            None
        };
        AgentView {
            agent: self.agent.clone(),
            update_requested: manual || lagging,
            refresh_tools_pending: self.refresh_tools_pending,
            restart_pending: self.restart_pending,
            update_status,
            last_adhoc_job: self.last_adhoc_job,
        }
    }
}

#[derive(Default)]
struct AgentMap {
    agents: HashMap<String, AgentEntry>,
    manual_updates: HashSet<String>,
    update_target: String,
}

/// Response to an operator action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub accepted: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_execution_id: Option<JobExecutionId>,
}

/// Tracks agents and decides what each heartbeat should be told.
pub struct AgentCoordinator {
    jobs: Arc<dyn JobExecutionRepository>,
    state: Arc<dyn AppStateRepository>,
    config: SchedulerConfig,
    inner: Mutex<AgentMap>,
    /// Sequence number of the last snapshot written, per agent.
    persisted: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl AgentCoordinator {
    pub fn new(
        jobs: Arc<dyn JobExecutionRepository>,
        state: Arc<dyn AppStateRepository>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            state,
            config,
            inner: Mutex::new(AgentMap::default()),
            persisted: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, AgentMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload snapshots, deactivation flags and the update target.
    pub async fn restore(&self) -> Result<usize> {
        let target = self.state.get(UPDATE_TARGET_KEY).await?.unwrap_or_default();
        let snapshots = self.state.list_prefix(SNAPSHOT_PREFIX).await?;
        let deactivated: HashSet<String> = self
            .state
            .list_prefix(DEACTIVATED_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(DEACTIVATED_PREFIX).map(str::to_string))
            .collect();

        let mut restored = Vec::with_capacity(snapshots.len());
        for (key, value) in snapshots {
            match serde_json::from_str::<Agent>(&value) {
                Ok(mut agent) => {
                    agent.deactivated = deactivated.contains(&agent.agent_id);
                    restored.push(agent);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable agent snapshot"),
            }
        }

        let count = restored.len();
        let mut map = self.map();
        map.update_target = target;
        for agent in restored {
            map.agents
                .insert(agent.agent_id.clone(), AgentEntry::new(agent));
        }
        drop(map);

        info!(agents = count, "restored agent snapshots");
        Ok(count)
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.heartbeat_at(request, Utc::now()).await
    }

    /// Record a heartbeat observed at `now` and decide on updates.
    pub async fn heartbeat_at(
        &self,
        request: &HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        let agent_id = request.agent_id.trim();
        if agent_id.is_empty() {
            return Err(Error::invalid("agent_id is required"));
        }
        let busy = self.jobs.has_active_for_agent(agent_id).await?;

        let (response, snapshot, seq, decision) = {
            let mut map = self.map();
            let target = map.update_target.clone();
            let manual = map.manual_updates.contains(agent_id);
            let entry = map
                .agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentEntry::new(blank_agent(agent_id, now)));

            entry.seq += 1;
            let seq = entry.seq;
            let agent = &mut entry.agent;
            agent.hostname = request.hostname.clone();
            agent.os = request.os.clone();
            agent.arch = request.arch.clone();
            agent.version = request.version.clone();
            agent.capabilities = request.capabilities.clone();
            agent.last_seen_utc = agent.last_seen_utc.max(now);

            let decision = if manual {
                agent.update.pending_busy = busy;
                if busy {
                    UpdateDecision::PendingBusy
                } else {
                    agent.update.attempts += 1;
                    agent.update.last_request_utc = Some(now);
                    UpdateDecision::Requested
                }
            } else {
                decide_update(
                    &mut agent.update,
                    agent_id,
                    &request.version,
                    &target,
                    busy,
                    now,
                    &self.config,
                )
            };

            let refresh = entry.refresh_tools_pending > 0;
            entry.refresh_tools_pending = entry.refresh_tools_pending.saturating_sub(1);
            let restart = entry.restart_pending > 0;
            entry.restart_pending = entry.restart_pending.saturating_sub(1);

            let message = if entry.agent.deactivated {
                Some(DEACTIVATED_MESSAGE.to_string())
            } else if decision == UpdateDecision::PendingBusy {
                Some(PENDING_BUSY_MESSAGE.to_string())
            } else {
                None
            };
            let requested = decision == UpdateDecision::Requested;
            let response = HeartbeatResponse {
                accepted: true,
                update_requested: requested,
                update_target: if requested { target } else { String::new() },
                refresh_tools_requested: refresh,
                restart_requested: restart,
                message,
            };
            let snapshot = entry.agent.clone();
            if requested && manual {
                map.manual_updates.remove(agent_id);
            }
            (response, snapshot, seq, decision)
        };

        self.persist_snapshot(&snapshot, seq).await?;

        match decision {
            UpdateDecision::Requested => info!(
                agent_id,
                version = %snapshot.version,
                target = %response.update_target,
                attempts = snapshot.update.attempts,
                "requested agent update"
            ),
            UpdateDecision::PendingBusy => debug!(agent_id, "agent update deferred, agent busy"),
            _ => debug!(agent_id, busy, "heartbeat"),
        }
        Ok(response)
    }

    /// Write `snapshot` unless a newer one for the same agent was already
    /// written.
    async fn persist_snapshot(&self, snapshot: &Agent, seq: u64) -> Result<bool> {
        let mut persisted = self.persisted.lock().await;
        let last = persisted.entry(snapshot.agent_id.clone()).or_default();
        if seq <= *last {
            debug!(agent_id = %snapshot.agent_id, seq, last = *last, "skipping stale agent snapshot");
            return Ok(false);
        }
        self.state
            .set(
                &format!("{SNAPSHOT_PREFIX}{}", snapshot.agent_id),
                &serde_json::to_string(snapshot)?,
            )
            .await?;
        *last = seq;
        Ok(true)
    }

    pub fn is_deactivated(&self, agent_id: &str) -> bool {
        self.map()
            .agents
            .get(agent_id)
            .is_some_and(|e| e.agent.deactivated)
    }

    /// Capabilities from the agent's last heartbeat.
    pub fn stored_capabilities(&self, agent_id: &str) -> CapabilityMap {
        self.map()
            .agents
            .get(agent_id)
            .map(|e| e.agent.capabilities.clone())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<AgentView> {
        let map = self.map();
        let mut views: Vec<AgentView> = map
            .agents
            .iter()
            .map(|(id, e)| e.view(map.manual_updates.contains(id), &map.update_target))
            .collect();
        views.sort_by(|a, b| a.agent.agent_id.cmp(&b.agent.agent_id));
        views
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentView> {
        let map = self.map();
        map.agents
            .get(agent_id)
            .map(|e| e.view(map.manual_updates.contains(agent_id), &map.update_target))
            .ok_or_else(|| Error::not_found(format!("agent {agent_id} not found")))
    }

    pub fn update_target(&self) -> String {
        self.map().update_target.clone()
    }

    /// Set or clear (with an empty string) the fleet update target.
    pub async fn set_update_target(&self, target: &str) -> Result<()> {
        let target = target.trim();
        if target.is_empty() {
            self.state.delete(UPDATE_TARGET_KEY).await?;
        } else {
            if Version::parse(target).is_none() {
                return Err(Error::invalid(format!(
                    "update target {target:?} is not a version"
                )));
            }
            self.state.set(UPDATE_TARGET_KEY, target).await?;
        }
        self.map().update_target = target.to_string();
        info!(target, "agent update target changed");
        Ok(())
    }

    pub async fn set_deactivated(&self, agent_id: &str, deactivated: bool) -> Result<AgentView> {
        self.get(agent_id)?;
        let key = format!("{DEACTIVATED_PREFIX}{agent_id}");
        if deactivated {
            self.state.set(&key, "1").await?;
        } else {
            self.state.delete(&key).await?;
        }
        if let Some(entry) = self.map().agents.get_mut(agent_id) {
            entry.agent.deactivated = deactivated;
        }
        info!(agent_id, deactivated, "agent activation changed");
        self.get(agent_id)
    }

    /// Queue an operator action for an agent.
    pub async fn request_action(
        &self,
        agent_id: &str,
        action: &AgentAction,
    ) -> Result<ActionResponse> {
        let view = self.get(agent_id)?;
        let accepted = |message: &str| ActionResponse {
            accepted: true,
            message: message.to_string(),
            job_execution_id: None,
        };

        let response = match action {
            AgentAction::Update => {
                self.map().manual_updates.insert(agent_id.to_string());
                accepted("update requested")
            }
            AgentAction::RefreshTools => {
                if let Some(entry) = self.map().agents.get_mut(agent_id) {
                    entry.refresh_tools_pending += 1;
                }
                accepted("tools refresh requested")
            }
            AgentAction::Restart => {
                if let Some(entry) = self.map().agents.get_mut(agent_id) {
                    entry.restart_pending += 1;
                }
                accepted("restart requested")
            }
            AgentAction::RunAdhoc {
                script,
                shell,
                timeout_seconds,
            } => {
                if view.agent.deactivated {
                    return Err(Error::constraint(format!(
                        "agent {agent_id} is deactivated"
                    )));
                }
                let shell = shell
                    .as_deref()
                    .or_else(|| view.agent.capabilities.get(KEY_SHELL).map(String::as_str))
                    .unwrap_or(DEFAULT_SHELL);
                let pending =
                    build_adhoc_job(agent_id, script, shell, *timeout_seconds, &self.config)?;
                let created = self.jobs.create_batch(&[pending], Utc::now()).await?;
                let id = created
                    .first()
                    .map(|j| j.id)
                    .ok_or_else(|| Error::Internal("adhoc job was not created".into()))?;
                if let Some(entry) = self.map().agents.get_mut(agent_id) {
                    entry.last_adhoc_job = Some(id);
                }
                ActionResponse {
                    accepted: true,
                    message: "adhoc run queued".to_string(),
                    job_execution_id: Some(id),
                }
            }
        };
        info!(agent_id, message = %response.message, "agent action accepted");
        Ok(response)
    }
}
