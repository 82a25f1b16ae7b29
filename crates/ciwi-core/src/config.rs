//! Project configuration types.
//!
//! These types represent the user-authored project file (`ciwi-project.yaml`)
//! after parsing. Structural validation lives with the scheduler, which owns
//! the dependency graphs.

use crate::capability::CapabilityMap;
use crate::vault::SecretRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CONFIG_FILE: &str = "ciwi-project.yaml";
pub const DEFAULT_VERSION_FILE: &str = "VERSION";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    pub project: ProjectSection,
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
    #[serde(default)]
    pub pipeline_chains: Vec<ChainSpec>,
}

fn default_config_version() -> u32 {
    1
}

impl ProjectConfig {
    /// Parse a project file. Only syntax is checked here.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineSpec> {
        self.pipelines.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    pub name: String,
    #[serde(default)]
    pub vault: Option<ProjectVaultConfig>,
}

/// Vault binding declared in the project file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectVaultConfig {
    #[serde(default)]
    pub connection: String,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub versioning: Option<VersioningSpec>,
    pub jobs: Vec<JobSpec>,
}

impl PipelineSpec {
    pub fn job(&self, id: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn source_repo(&self) -> Option<&str> {
        self.source
            .as_ref()
            .map(|s| s.repo.trim())
            .filter(|r| !r.is_empty())
    }
}

/// Where a pipeline checks out its sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersioningSpec {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub tag_prefix: String,
    #[serde(default)]
    pub auto_bump: Option<BumpMode>,
    /// Name of the project secret holding the token used to push the bump.
    #[serde(default)]
    pub auto_bump_vcs_token: Option<String>,
}

impl VersioningSpec {
    pub fn version_file(&self) -> &str {
        self.file
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_VERSION_FILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpMode {
    Patch,
    Minor,
    Major,
}

impl BumpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BumpMode::Patch => "patch",
            BumpMode::Minor => "minor",
            BumpMode::Major => "major",
        }
    }

    /// Increment the selected component of a `MAJOR.MINOR.PATCH` version,
    /// zeroing the lower ones.
    pub fn bump(&self, raw: &str) -> Option<String> {
        let parts = raw
            .trim()
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [major, minor, patch] = parts.as_slice() else {
            return None;
        };
        Some(match self {
            BumpMode::Patch => format!("{major}.{minor}.{}", patch + 1),
            BumpMode::Minor => format!("{major}.{}.0", minor + 1),
            BumpMode::Major => format!("{}.0.0", major + 1),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub runs_on: CapabilityMap,
    #[serde(default)]
    pub requires: RequiresSpec,
    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
}

fn default_job_timeout() -> u64 {
    3600
}

impl JobSpec {
    pub fn has_dry_run_skip_steps(&self) -> bool {
        self.steps.iter().any(|s| s.skip_dry_run)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequiresSpec {
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub container: ContainerRequires,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRequires {
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub env: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub test: Option<TestStepSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub skip_dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStepSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "default_test_format")]
    pub format: String,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub coverage_format: Option<String>,
    #[serde(default)]
    pub coverage_report: Option<String>,
}

fn default_test_format() -> String {
    "go-test-json".to_string()
}

/// Matrix as an explicit list of variable maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixSpec {
    #[serde(default)]
    pub include: Vec<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub id: String,
    pub pipelines: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
version: 1
project:
  name: ciwi
  vault:
    connection: home-vault
    secrets:
      - name: github-token
        path: ci/github
        key: token
pipelines:
  - id: build
    source:
      repo: https://github.com/example/ciwi.git
      ref: main
    versioning:
      file: VERSION
      tag_prefix: v
      auto_bump: patch
    jobs:
      - id: compile
        runs_on:
          os: linux
        requires:
          tools:
            go: ">=1.22"
        matrix:
          include:
            - name: linux-amd64
              goarch: amd64
        steps:
          - run: go build ./...
          - test:
              name: unit
              command: go test -json ./...
          - run: ./publish.sh
            skip_dry_run: true
pipeline_chains:
  - id: release
    pipelines: [build]
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg = ProjectConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.project.name, "ciwi");
        let build = cfg.pipeline("build").unwrap();
        assert_eq!(build.source_repo(), Some("https://github.com/example/ciwi.git"));
        let versioning = build.versioning.as_ref().unwrap();
        assert_eq!(versioning.auto_bump, Some(BumpMode::Patch));
        assert_eq!(versioning.version_file(), "VERSION");
        let job = build.job("compile").unwrap();
        assert_eq!(job.timeout_seconds, 3600);
        assert!(job.has_dry_run_skip_steps());
        assert_eq!(job.steps[1].test.as_ref().unwrap().format, "go-test-json");
        assert_eq!(cfg.pipeline_chains[0].pipelines, vec!["build".to_string()]);
    }

    #[test]
    fn test_invalid_yaml_is_invalid_input() {
        let err = ProjectConfig::from_yaml("project: [").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_bump_modes() {
        assert_eq!(BumpMode::Patch.bump("1.2.3").as_deref(), Some("1.2.4"));
        assert_eq!(BumpMode::Minor.bump("1.2.3").as_deref(), Some("1.3.0"));
        assert_eq!(BumpMode::Major.bump("1.2.3").as_deref(), Some("2.0.0"));
        assert_eq!(BumpMode::Patch.bump("1.2"), None);
    }
}
