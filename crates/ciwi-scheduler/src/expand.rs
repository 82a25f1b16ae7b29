//! Pipeline expansion: from a persisted pipeline and a selection to the
//! list of pending job executions.
//!
//! Expansion only reads from the store. Persisting the result is the job of
//! [`crate::enqueue::EnqueueService`].

use crate::autobump::{AUTO_BUMP_STEP_NAME, AUTO_BUMP_TOKEN_ENV, build_auto_bump_step_script};
use crate::config::SchedulerConfig;
use crate::dependency::{DependencyContext, artifact_env, encode_producers, resolve_dependency_context};
use crate::matrix::{MatrixExpander, VersionTokens, render};
use crate::requirements::assemble_requirements;
use crate::run_id::RunIdGenerator;
use ciwi_core::config::{BumpMode, JobSpec, PipelineSpec, SourceSpec, StepSpec};
use ciwi_core::job::{CreateJobExecution, StepKind, StepPlanItem, script_from_plan};
use ciwi_core::metadata::{self, FLAG_SET, Metadata};
use ciwi_core::ports::{JobExecutionRepository, SourceRepository};
use ciwi_core::project::{PersistedPipeline, Project, ProjectVaultSettings};
use ciwi_core::source::{ReportFn, ResolvedVersion, VersionRequest, is_commit_sha, no_report};
use ciwi_core::vault::{SecretRef, placeholder_names};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// How job executions obtain their sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Online,
    /// Reuse the commit and version recorded by the last successful run.
    OfflineCached,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Online => "online",
            ExecutionMode::OfflineCached => "offline_cached",
        }
    }
}

/// Narrows what a run enqueues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub pipeline_job_id: Option<String>,
    #[serde(default)]
    pub matrix_name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Extra metadata merged into every pending job.
    #[serde(default)]
    pub meta_patch: Metadata,
}

impl Selection {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    /// The part of a selection that applies to every member of a chain.
    pub fn for_chain_member(&self) -> Self {
        Self {
            pipeline_job_id: None,
            matrix_name: None,
            ..self.clone()
        }
    }

    fn source_ref_override(&self) -> Option<&str> {
        self.source_ref.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }
}

/// Output of expanding one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub pipeline_id: String,
    pub pipeline_run_id: String,
    pub version: ResolvedVersion,
    /// Context later chain members inherit from this run.
    pub context: DependencyContext,
    pub pending: Vec<CreateJobExecution>,
}

/// Expands pipelines into pending job executions.
pub struct PipelineExpander {
    jobs: Arc<dyn JobExecutionRepository>,
    source: Arc<dyn SourceRepository>,
    run_ids: Arc<RunIdGenerator>,
    matrix: MatrixExpander,
    config: SchedulerConfig,
}

impl PipelineExpander {
    pub fn new(
        jobs: Arc<dyn JobExecutionRepository>,
        source: Arc<dyn SourceRepository>,
        run_ids: Arc<RunIdGenerator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            source,
            run_ids,
            matrix: MatrixExpander::new(),
            config,
        }
    }

    pub fn run_ids(&self) -> &RunIdGenerator {
        &self.run_ids
    }

    /// Expand `pipeline` under `selection`.
    ///
    /// `forced` replaces the dependency context lookup; chains use it so
    /// later members share the version and commit of the first.
    pub async fn expand(
        &self,
        project: &Project,
        pipeline: &PersistedPipeline,
        selection: &Selection,
        forced: Option<&DependencyContext>,
    ) -> Result<Expansion> {
        let spec = &pipeline.spec;
        let source = self.effective_source(spec, selection)?;

        let mut ctx = match (forced, selection.execution_mode) {
            (Some(forced), _) => forced.clone(),
            (None, ExecutionMode::OfflineCached) => {
                self.offline_context(&project.name, spec).await?
            }
            (None, ExecutionMode::Online) => {
                resolve_dependency_context(self.jobs.as_ref(), &project.name, spec).await?
            }
        };
        // An explicit ref, or a commit of some other repository, never
        // replaces what this pipeline checks out. A forced context is kept
        // as is so chain members build the commit the first member pinned.
        let foreign_commit = source
            .as_ref()
            .is_some_and(|s| !ctx.source_repo.is_empty() && !same_repo(&ctx.source_repo, &s.repo));
        if forced.is_none() && (selection.source_ref_override().is_some() || foreign_commit) {
            ctx.source_repo.clear();
            ctx.source_ref_resolved.clear();
        }

        let version = self
            .resolve_version(spec, source.as_ref(), &ctx, &no_report)
            .await?;
        let run_id = self.run_ids.pipeline_run_id();

        let source_repo = source
            .as_ref()
            .map(|s| s.repo.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| ctx.source_repo.clone());
        let source_ref_raw = source
            .as_ref()
            .map(|s| s.git_ref.trim().to_string())
            .unwrap_or_default();
        let source_ref_resolved = if !version.source_ref_resolved.is_empty() {
            version.source_ref_resolved.clone()
        } else {
            ctx.source_ref_resolved.clone()
        };

        let run = RunValues {
            project,
            spec,
            run_id: &run_id,
            version: &version,
            source_repo: &source_repo,
            source_ref_raw: &source_ref_raw,
            source_ref_resolved: &source_ref_resolved,
            ctx: &ctx,
            selection,
        };

        let selected: Vec<(usize, &JobSpec)> = match selection.pipeline_job_id.as_deref() {
            Some(job_id) => {
                let index = spec.jobs.iter().position(|j| j.id == job_id).ok_or_else(|| {
                    Error::invalid(format!("pipeline {} has no job {job_id:?}", spec.id))
                })?;
                vec![(index, &spec.jobs[index])]
            }
            None => spec.jobs.iter().enumerate().collect(),
        };

        let mut pending: Vec<(String, CreateJobExecution)> = Vec::new();
        for (job_index, job) in &selected {
            if selection.execution_mode == ExecutionMode::OfflineCached
                && !selection.dry_run
                && job.has_dry_run_skip_steps()
            {
                return Err(Error::constraint(format!(
                    "job {} has steps skipped in dry runs; offline cached execution requires a dry run",
                    job.id
                )));
            }
            for cell in self.matrix.expand(job) {
                if let Some(wanted) = selection.matrix_name.as_deref()
                    && cell.name != wanted
                {
                    continue;
                }
                let vars = self.matrix.variables(
                    &cell,
                    &VersionTokens {
                        version_raw: version.raw.clone(),
                        version: version.tagged.clone(),
                        tag_prefix: version.tag_prefix.clone(),
                    },
                );
                let pending_job = run.pending_job(*job_index, job, cell.index, &cell.name, &vars)?;
                pending.push((job.id.clone(), pending_job));
            }
        }

        let produced: BTreeSet<&str> = pending.iter().map(|(id, _)| id.as_str()).collect();
        for (_, job) in &selected {
            if !produced.contains(job.id.as_str()) {
                continue;
            }
            if let Some(missing) = job.needs.iter().find(|n| !produced.contains(n.as_str())) {
                return Err(Error::constraint(format!(
                    "selection excludes required job \"{missing}\" needed by \"{}\"",
                    job.id
                )));
            }
        }

        let mut pending: Vec<CreateJobExecution> = pending.into_iter().map(|(_, p)| p).collect();
        if pending.is_empty() {
            return Err(Error::constraint("selection matched no matrix entries"));
        }

        for job in &mut pending {
            let needs = metadata::list(&job.metadata, metadata::NEEDS_JOB_IDS);
            if !needs.is_empty() {
                job.metadata
                    .insert(metadata::NEEDS_BLOCKED.to_string(), FLAG_SET.to_string());
            }
        }

        if let Some(mode) = spec.versioning.as_ref().and_then(|v| v.auto_bump)
            && !selection.dry_run
        {
            self.append_auto_bump(project, spec, mode, &version, &source_ref_raw, &mut pending)?;
        }

        debug!(
            project = %project.name,
            pipeline_id = %spec.id,
            pipeline_run_id = %run_id,
            jobs = pending.len(),
            version = %version.tagged,
            "expanded pipeline"
        );

        Ok(Expansion {
            pipeline_id: spec.id.clone(),
            pipeline_run_id: run_id,
            context: DependencyContext {
                version_raw: version.raw.clone(),
                version: version.tagged.clone(),
                tag_prefix: version.tag_prefix.clone(),
                source_repo,
                source_ref_resolved,
                artifact_job_ids: BTreeMap::new(),
            },
            version,
            pending,
        })
    }

    /// Version a run of `pipeline` would use, without enqueueing anything.
    pub async fn preview_version(
        &self,
        project: &Project,
        pipeline: &PersistedPipeline,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion> {
        let spec = &pipeline.spec;
        let source = self.effective_source(spec, &Selection::default())?;
        let mut ctx = resolve_dependency_context(self.jobs.as_ref(), &project.name, spec).await?;
        if source
            .as_ref()
            .is_some_and(|s| !ctx.source_repo.is_empty() && !same_repo(&ctx.source_repo, &s.repo))
        {
            ctx.source_ref_resolved.clear();
        }
        self.resolve_version(spec, source.as_ref(), &ctx, report).await
    }

    /// Source spec after applying a selection's ref override.
    fn effective_source(&self, spec: &PipelineSpec, selection: &Selection) -> Result<Option<SourceSpec>> {
        let mut source = spec.source.clone().filter(|s| !s.repo.trim().is_empty());
        if let Some(override_ref) = selection.source_ref_override() {
            let Some(src) = source.as_mut() else {
                return Err(Error::constraint(format!(
                    "source ref override requires pipeline {} to declare a source repo",
                    spec.id
                )));
            };
            let allowed = self.config.source_ref_override_repo.trim();
            if !allowed.is_empty() && !same_repo(allowed, &src.repo) {
                return Err(Error::constraint(format!(
                    "source ref override is not enabled for repository {}",
                    src.repo
                )));
            }
            src.git_ref = override_ref.to_string();
        }
        Ok(source)
    }

    async fn offline_context(&self, project: &str, spec: &PipelineSpec) -> Result<DependencyContext> {
        let cached = self
            .jobs
            .latest_succeeded_with_source(project, &spec.id)
            .await?
            .ok_or_else(|| {
                Error::constraint(format!(
                    "offline cached execution requires a previous successful run of pipeline {}",
                    spec.id
                ))
            })?;
        let ctx = DependencyContext::from_execution(&cached);
        if !is_commit_sha(&ctx.source_ref_resolved) {
            return Err(Error::constraint(format!(
                "cached source ref {:?} of pipeline {} is not a commit sha",
                ctx.source_ref_resolved, spec.id
            )));
        }
        Ok(ctx)
    }

    async fn resolve_version(
        &self,
        spec: &PipelineSpec,
        source: Option<&SourceSpec>,
        ctx: &DependencyContext,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion> {
        if ctx.has_version() {
            return Ok(ResolvedVersion {
                raw: ctx.version_raw.clone(),
                tagged: ctx.version.clone(),
                tag_prefix: ctx.tag_prefix.clone(),
                source_ref_resolved: ctx.source_ref_resolved.clone(),
            });
        }
        let Some(versioning) = spec.versioning.as_ref() else {
            return Ok(ResolvedVersion {
                source_ref_resolved: ctx.source_ref_resolved.clone(),
                ..Default::default()
            });
        };
        let Some(source) = source else {
            return Err(Error::constraint(format!(
                "pipeline {} declares versioning without a source repo",
                spec.id
            )));
        };
        let request = VersionRequest {
            repo_url: source.repo.trim().to_string(),
            git_ref: source.git_ref.trim().to_string(),
            version_file: versioning.version_file().to_string(),
            tag_prefix: versioning.tag_prefix.clone(),
        };
        self.source.resolve_version(&request, report).await
    }

    fn append_auto_bump(
        &self,
        project: &Project,
        spec: &PipelineSpec,
        mode: BumpMode,
        version: &ResolvedVersion,
        source_ref_raw: &str,
        pending: &mut [CreateJobExecution],
    ) -> Result<()> {
        if pending.len() != 1 {
            return Err(Error::constraint(format!(
                "auto bump requires exactly one job execution, pipeline {} expanded to {}",
                spec.id,
                pending.len()
            )));
        }
        let token = spec
            .versioning
            .as_ref()
            .and_then(|v| v.auto_bump_vcs_token.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::constraint(format!(
                    "pipeline {} enables auto bump without versioning.auto_bump_vcs_token",
                    spec.id
                ))
            })?;
        let next = mode.bump(&version.raw).ok_or_else(|| {
            Error::constraint(format!(
                "auto bump requires a resolved version for pipeline {}",
                spec.id
            ))
        })?;

        let env = BTreeMap::from([(
            AUTO_BUMP_TOKEN_ENV.to_string(),
            format!("{{{{ secret.{token} }}}}"),
        )]);
        let (vault_connection, secrets) = bind_secrets(&project.vault, &project.name, &env)?;
        let job = &mut pending[0];
        job.step_plan.push(StepPlanItem {
            index: job.step_plan.len(),
            name: AUTO_BUMP_STEP_NAME.to_string(),
            kind: StepKind::Run {
                script: build_auto_bump_step_script(mode),
            },
            env,
            vault_connection,
            secrets,
        });
        job.script = script_from_plan(&job.step_plan);
        job.metadata.insert(metadata::NEXT_VERSION.to_string(), next);
        let branch = source_ref_raw.trim().trim_start_matches("refs/heads/");
        if !branch.is_empty() && !is_commit_sha(branch) {
            job.metadata
                .insert(metadata::AUTO_BUMP_BRANCH.to_string(), branch.to_string());
        }
        Ok(())
    }
}

/// Per-run values shared by every pending job of one expansion.
struct RunValues<'a> {
    project: &'a Project,
    spec: &'a PipelineSpec,
    run_id: &'a str,
    version: &'a ResolvedVersion,
    source_repo: &'a str,
    source_ref_raw: &'a str,
    source_ref_resolved: &'a str,
    ctx: &'a DependencyContext,
    selection: &'a Selection,
}

impl RunValues<'_> {
    fn pending_job(
        &self,
        job_index: usize,
        job: &JobSpec,
        matrix_index: usize,
        matrix_name: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<CreateJobExecution> {
        let dry_run = self.selection.dry_run;
        let step_plan = job
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.step_item(job, i, step, vars))
            .collect::<Result<Vec<_>>>()?;
        let requirements = assemble_requirements(job, self.selection.agent_id.as_deref())?;

        let mut meta = Metadata::new();
        let mut put = |key: &str, value: &str| {
            if !value.is_empty() {
                meta.insert(key.to_string(), value.to_string());
            }
        };
        put(metadata::PROJECT, &self.project.name);
        put(metadata::PROJECT_ID, &self.project.id.to_string());
        put(metadata::PIPELINE_ID, &self.spec.id);
        put(metadata::PIPELINE_RUN_ID, self.run_id);
        put(metadata::PIPELINE_JOB_ID, &job.id);
        put(metadata::PIPELINE_JOB_INDEX, &job_index.to_string());
        put(metadata::MATRIX_INDEX, &matrix_index.to_string());
        put(metadata::MATRIX_NAME, matrix_name);
        put(metadata::PIPELINE_VERSION, &self.version.tagged);
        put(metadata::PIPELINE_VERSION_RAW, &self.version.raw);
        put(metadata::PIPELINE_SOURCE_REPO, self.source_repo);
        put(metadata::PIPELINE_SOURCE_REF_RAW, self.source_ref_raw);
        put(metadata::PIPELINE_SOURCE_REF_RESOLVED, self.source_ref_resolved);
        if dry_run {
            put(metadata::DRY_RUN, FLAG_SET);
        }
        if self.selection.execution_mode != ExecutionMode::Online {
            put(metadata::EXECUTION_MODE, self.selection.execution_mode.as_str());
        }
        put(metadata::NEEDS_JOB_IDS, &job.needs.join(","));
        put(
            metadata::DEP_ARTIFACT_JOB_IDS,
            &encode_producers(&self.ctx.artifact_job_ids),
        );
        meta.extend(requirements.container_metadata);
        meta.extend(
            self.selection
                .meta_patch
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: &str| {
            if !value.is_empty() {
                env.insert(key.to_string(), value.to_string());
            }
        };
        set("CIWI_PROJECT", &self.project.name);
        set("CIWI_PIPELINE_ID", &self.spec.id);
        set("CIWI_PIPELINE_RUN_ID", self.run_id);
        set("CIWI_PIPELINE_JOB_ID", &job.id);
        set("CIWI_MATRIX_NAME", matrix_name);
        set("CIWI_PIPELINE_VERSION", &self.version.tagged);
        set("CIWI_PIPELINE_VERSION_RAW", &self.version.raw);
        set("CIWI_PIPELINE_TAG_PREFIX", &self.version.tag_prefix);
        if let Some(versioning) = &self.spec.versioning {
            set("CIWI_PIPELINE_VERSION_FILE", versioning.version_file());
        }
        set("CIWI_PIPELINE_SOURCE_REPO", self.source_repo);
        set("CIWI_PIPELINE_SOURCE_REF_RAW", self.source_ref_raw);
        set("CIWI_PIPELINE_SOURCE_REF", self.source_ref_resolved);
        if dry_run {
            set("CIWI_DRY_RUN", FLAG_SET);
        }
        env.extend(artifact_env(&self.ctx.artifact_job_ids));

        let source = (!self.source_repo.is_empty()).then(|| SourceSpec {
            repo: self.source_repo.to_string(),
            git_ref: if self.source_ref_resolved.is_empty() {
                self.source_ref_raw.to_string()
            } else {
                self.source_ref_resolved.to_string()
            },
        });

        let mut caches = job.caches.clone();
        for cache in &mut caches {
            cache.key = render(&cache.key, vars);
        }

        Ok(CreateJobExecution {
            script: script_from_plan(&step_plan),
            env,
            required_capabilities: requirements.capabilities,
            timeout_seconds: job.timeout_seconds,
            artifact_globs: job.artifacts.iter().map(|g| render(g, vars)).collect(),
            caches,
            source,
            step_plan,
            metadata: meta,
        })
    }

    fn step_item(
        &self,
        job: &JobSpec,
        index: usize,
        step: &StepSpec,
        vars: &BTreeMap<String, String>,
    ) -> Result<StepPlanItem> {
        let name = step
            .name
            .clone()
            .or_else(|| step.test.as_ref().map(|t| t.name.clone()))
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("step {}", index + 1));
        let name = render(&name, vars);

        if step.skip_dry_run && self.selection.dry_run {
            return Ok(StepPlanItem {
                index,
                name,
                kind: StepKind::DryrunSkip,
                env: BTreeMap::new(),
                vault_connection: None,
                secrets: Vec::new(),
            });
        }

        let env: BTreeMap<String, String> = step
            .env
            .iter()
            .map(|(k, v)| (k.clone(), render(v, vars)))
            .collect();

        let kind = match (&step.test, &step.run) {
            (Some(test), _) => StepKind::Test {
                script: render(&test.command, vars),
                test_name: render(&test.name, vars),
                test_format: test.format.clone(),
                test_report: test.report.as_ref().map(|r| render(r, vars)),
                coverage_format: test.coverage_format.clone(),
                coverage_report: test.coverage_report.as_ref().map(|r| render(r, vars)),
            },
            (None, Some(run)) => StepKind::Run {
                script: render(run, vars),
            },
            (None, None) => {
                return Err(Error::invalid(format!(
                    "step {} of job {} has nothing to run",
                    index + 1,
                    job.id
                )));
            }
        };

        let (vault_connection, secrets) = bind_secrets(&self.project.vault, &self.project.name, &env)
            .map_err(|e| Error::constraint(format!("job {} step {name}: {e}", job.id)))?;

        Ok(StepPlanItem {
            index,
            name,
            kind,
            env,
            vault_connection,
            secrets,
        })
    }
}

/// Attach the project's vault connection and the secret references named by
/// placeholders in `env`.
fn bind_secrets(
    vault: &ProjectVaultSettings,
    project: &str,
    env: &BTreeMap<String, String>,
) -> Result<(Option<String>, Vec<SecretRef>)> {
    let mut names: Vec<String> = Vec::new();
    for value in env.values() {
        for name in placeholder_names(value) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return Ok((None, Vec::new()));
    }
    let connection = vault.connection_name().ok_or_else(|| {
        Error::constraint(format!(
            "project {project} uses secrets but has no vault connection"
        ))
    })?;
    let secrets = names
        .iter()
        .map(|name| {
            vault.secret(name).cloned().ok_or_else(|| {
                Error::constraint(format!("project {project} has no secret named {name:?}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((Some(connection.to_string()), secrets))
}

fn same_repo(a: &str, b: &str) -> bool {
    fn norm(s: &str) -> &str {
        let s = s.trim().trim_end_matches('/');
        s.strip_suffix(".git").unwrap_or(s)
    }
    norm(a).eq_ignore_ascii_case(norm(b))
}
