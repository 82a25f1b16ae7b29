//! Dependency context inherited from upstream pipeline runs.

use ciwi_core::config::PipelineSpec;
use ciwi_core::job::{JobExecution, JobExecutionStatus};
use ciwi_core::metadata;
use ciwi_core::ports::JobExecutionRepository;
use ciwi_core::{Error, Result};
use std::collections::BTreeMap;

pub const ENV_DEP_ARTIFACT_JOB_ID: &str = "CIWI_DEP_ARTIFACT_JOB_ID";
pub const ENV_DEP_ARTIFACT_JOB_IDS: &str = "CIWI_DEP_ARTIFACT_JOB_IDS";

/// Values a pipeline run inherits from its upstreams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyContext {
    pub version_raw: String,
    pub version: String,
    pub tag_prefix: String,
    pub source_repo: String,
    pub source_ref_resolved: String,
    /// `<pipeline>:<target>` to the id of the execution that produced it.
    pub artifact_job_ids: BTreeMap<String, String>,
}

impl DependencyContext {
    pub fn has_version(&self) -> bool {
        !self.version_raw.is_empty()
    }

    pub fn has_source(&self) -> bool {
        !self.source_repo.is_empty() && !self.source_ref_resolved.is_empty()
    }

    /// Context read from the metadata of a finished execution.
    pub fn from_execution(job: &JobExecution) -> Self {
        let version_raw = job.meta(metadata::PIPELINE_VERSION_RAW).unwrap_or_default();
        let version = job.meta(metadata::PIPELINE_VERSION).unwrap_or(version_raw);
        Self {
            version_raw: version_raw.to_string(),
            version: version.to_string(),
            tag_prefix: version
                .strip_suffix(version_raw)
                .unwrap_or_default()
                .to_string(),
            source_repo: job
                .meta(metadata::PIPELINE_SOURCE_REPO)
                .unwrap_or_default()
                .to_string(),
            source_ref_resolved: job
                .meta(metadata::PIPELINE_SOURCE_REF_RESOLVED)
                .unwrap_or_default()
                .to_string(),
            artifact_job_ids: BTreeMap::new(),
        }
    }
}

/// Ids of the succeeded executions of `pipeline_id`, keyed by
/// `<pipeline_id>:<build_target | matrix_name | pipeline_job_id>`.
pub fn artifact_producers(pipeline_id: &str, jobs: &[JobExecution]) -> BTreeMap<String, String> {
    jobs.iter()
        .filter(|j| j.status == JobExecutionStatus::Succeeded)
        .filter_map(|j| {
            let key = j
                .meta(metadata::BUILD_TARGET)
                .or_else(|| j.meta(metadata::MATRIX_NAME))
                .or_else(|| j.meta(metadata::PIPELINE_JOB_ID))?;
            Some((format!("{pipeline_id}:{key}"), j.id.to_string()))
        })
        .collect()
}

/// `key=id` pairs joined by commas, as stored in `dep_artifact_job_ids`.
pub fn encode_producers(producers: &BTreeMap<String, String>) -> String {
    producers
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Environment exposing the producers to job scripts. The singular variable
/// is set only when there is exactly one producer.
pub fn artifact_env(producers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if producers.is_empty() {
        return env;
    }
    env.insert(ENV_DEP_ARTIFACT_JOB_IDS.to_string(), encode_producers(producers));
    if let [only] = producers.values().collect::<Vec<_>>().as_slice() {
        env.insert(ENV_DEP_ARTIFACT_JOB_ID.to_string(), (*only).clone());
    }
    env
}

/// Resolve the context of `pipeline` from the latest runs of the pipelines
/// it depends on.
///
/// Every upstream's latest run must have finished with every execution
/// succeeded, and all upstreams that carry a version must agree on it.
pub async fn resolve_dependency_context(
    jobs: &dyn JobExecutionRepository,
    project: &str,
    pipeline: &PipelineSpec,
) -> Result<DependencyContext> {
    let mut ctx = DependencyContext::default();
    if pipeline.depends_on.is_empty() {
        return Ok(ctx);
    }

    let mut versions: Vec<(String, DependencyContext)> = Vec::new();
    let mut repos: Vec<(String, String)> = Vec::new();

    for dep in &pipeline.depends_on {
        let run = jobs.latest_pipeline_run(project, dep).await?;
        let Some(first) = run.first() else {
            return Err(Error::constraint(format!(
                "dependency pipeline {dep} has no runs"
            )));
        };
        let run_id = first.meta(metadata::PIPELINE_RUN_ID).unwrap_or_default();
        if run.iter().any(|j| !j.status.is_terminal()) {
            return Err(Error::constraint(format!(
                "dependency pipeline {dep} run {run_id} is still in progress"
            )));
        }
        if run.iter().any(|j| j.status != JobExecutionStatus::Succeeded) {
            return Err(Error::constraint(format!(
                "dependency pipeline {dep} latest run {run_id} did not succeed"
            )));
        }

        let dep_ctx = DependencyContext::from_execution(first);
        if dep_ctx.has_version() {
            versions.push((dep.clone(), dep_ctx.clone()));
        }
        repos.push((dep_ctx.source_repo.clone(), dep_ctx.source_ref_resolved.clone()));
        ctx.artifact_job_ids.extend(artifact_producers(dep, &run));
    }

    if let Some((_, first)) = versions.first() {
        if let Some((other_dep, other)) = versions.iter().find(|(_, v)| v.version != first.version) {
            return Err(Error::constraint(format!(
                "dependency pipelines disagree on version: {} is {} but {other_dep} is {}",
                versions[0].0, first.version, other.version
            )));
        }
        ctx.version_raw = first.version_raw.clone();
        ctx.version = first.version.clone();
        ctx.tag_prefix = first.tag_prefix.clone();
    }

    if let Some((repo, reference)) = repos.first()
        && !repo.is_empty()
        && repos.iter().all(|(r, _)| r == repo)
    {
        ctx.source_repo = repo.clone();
        ctx.source_ref_resolved = reference.clone();
    }

    Ok(ctx)
}
