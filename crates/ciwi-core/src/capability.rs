//! Capability maps and requirement matching.
//!
//! Agents advertise a free-form `key -> value` map. Job executions carry a
//! map of required capabilities whose keys select one of the requirement
//! kinds below:
//!
//! - `requires.tool.<name>`: version constraint against the agent's `tool.<name>`
//! - `requires.container.tool.<name>`: recorded only, probed agent-side
//! - `shell`: membership in the agent's `shells` list
//! - anything else: exact match

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub type CapabilityMap = BTreeMap<String, String>;

pub const TOOL_PREFIX: &str = "tool.";
pub const REQUIRES_TOOL_PREFIX: &str = "requires.tool.";
pub const REQUIRES_CONTAINER_TOOL_PREFIX: &str = "requires.container.tool.";
pub const KEY_OS: &str = "os";
pub const KEY_ARCH: &str = "arch";
pub const KEY_AGENT_ID: &str = "agent_id";
pub const KEY_SHELL: &str = "shell";
pub const KEY_SHELLS: &str = "shells";
pub const KEY_RUN_MODE: &str = "run_mode";

/// A dotted numeric version. Missing components compare as zero.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl Version {
    /// Parse `v1.2.3`, `1.2`, `1.2.3-rc1`. Suffixes after `-` or `+` are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix('v').unwrap_or(raw);
        let core = raw.split(['-', '+']).next().unwrap_or_default();
        if core.is_empty() {
            return None;
        }
        let parts = core
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Self(parts))
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Returns `Some(true)` when `candidate` is strictly older than `target`.
pub fn is_older_version(candidate: &str, target: &str) -> Option<bool> {
    Some(Version::parse(candidate)? < Version::parse(target)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Lt => ord == Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
        }
    }
}

/// A constraint on an observed tool version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// `*`: any observed value.
    Any,
    Compare { op: CompareOp, version: Version },
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(VersionConstraint::Any);
        }
        // Two-character operators first so `>=` is not read as `>`.
        let (op, rest) = [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("==", CompareOp::Eq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ]
        .iter()
        .find_map(|(sym, op)| raw.strip_prefix(sym).map(|rest| (*op, rest)))
        .unwrap_or((CompareOp::Eq, raw));
        let version = Version::parse(rest)
            .ok_or_else(|| format!("invalid version constraint {raw:?}"))?;
        Ok(VersionConstraint::Compare { op, version })
    }

    pub fn is_satisfied_by(&self, observed: &str) -> bool {
        let observed = observed.trim();
        if observed.is_empty() {
            return false;
        }
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Compare { op, version } => match Version::parse(observed) {
                Some(found) => op.holds(found.cmp(version)),
                None => false,
            },
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Compare { op, version } => write!(f, "{}{}", op.symbol(), version),
        }
    }
}

/// One entry of a required-capabilities map, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityRequirement {
    BareEqual { key: String, value: String },
    OperatorVersion { tool: String, constraint: VersionConstraint },
    ShellMembership { shell: String },
    /// In-container tool constraint; not enforced at lease time.
    ContainerProbe { tool: String, constraint: String },
}

impl CapabilityRequirement {
    pub fn classify(key: &str, value: &str) -> Result<Self, String> {
        if let Some(tool) = key.strip_prefix(REQUIRES_CONTAINER_TOOL_PREFIX) {
            return Ok(CapabilityRequirement::ContainerProbe {
                tool: tool.to_string(),
                constraint: value.to_string(),
            });
        }
        if let Some(tool) = key.strip_prefix(REQUIRES_TOOL_PREFIX) {
            return Ok(CapabilityRequirement::OperatorVersion {
                tool: tool.to_string(),
                constraint: VersionConstraint::parse(value)?,
            });
        }
        if key == KEY_SHELL {
            return Ok(CapabilityRequirement::ShellMembership {
                shell: value.trim().to_string(),
            });
        }
        Ok(CapabilityRequirement::BareEqual {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Check this requirement against an agent capability map, returning a
    /// human-readable reason on mismatch.
    pub fn check(&self, agent: &CapabilityMap) -> Result<(), String> {
        match self {
            CapabilityRequirement::BareEqual { key, value } => match agent.get(key) {
                Some(found) if found == value => Ok(()),
                Some(found) => Err(format!("{key}={found} does not match required {value}")),
                None => Err(format!("missing capability {key}={value}")),
            },
            CapabilityRequirement::OperatorVersion { tool, constraint } => {
                let observed_key = format!("{TOOL_PREFIX}{tool}");
                match agent.get(&observed_key) {
                    Some(found) if constraint.is_satisfied_by(found) => Ok(()),
                    Some(found) => Err(format!(
                        "tool {tool} version {found} does not satisfy {constraint}"
                    )),
                    None => Err(format!("tool {tool} not available")),
                }
            }
            CapabilityRequirement::ShellMembership { shell } => {
                if agent_supports_shell(agent, shell) {
                    Ok(())
                } else {
                    Err(format!("shell {shell} not supported"))
                }
            }
            CapabilityRequirement::ContainerProbe { .. } => Ok(()),
        }
    }
}

fn agent_supports_shell(agent: &CapabilityMap, shell: &str) -> bool {
    if shell.is_empty() {
        return true;
    }
    let listed = agent
        .get(KEY_SHELLS)
        .map(|shells| {
            shells
                .split(',')
                .map(str::trim)
                .any(|s| s.eq_ignore_ascii_case(shell))
        })
        .unwrap_or(false);
    listed || agent.get(KEY_SHELL).is_some_and(|s| s.eq_ignore_ascii_case(shell))
}

/// Check every required capability against the agent's map.
///
/// Returns the first mismatch reason. Matching is monotone: adding keys to
/// `agent` never turns a match into a mismatch.
pub fn match_requirements(required: &CapabilityMap, agent: &CapabilityMap) -> Result<(), String> {
    for (key, value) in required {
        let requirement = CapabilityRequirement::classify(key, value)?;
        requirement.check(agent)?;
    }
    Ok(())
}

/// Merge `overlay` on top of `base`; overlay keys win.
pub fn merge_capabilities(base: &CapabilityMap, overlay: &CapabilityMap) -> CapabilityMap {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}
