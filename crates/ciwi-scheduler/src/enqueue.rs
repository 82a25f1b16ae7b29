//! Enqueue: expand a pipeline or a chain and persist the result.

use crate::chain::expand_chain;
use crate::expand::{PipelineExpander, Selection};
use chrono::Utc;
use ciwi_core::ids::{ChainDbId, JobExecutionId, PipelineDbId};
use ciwi_core::job::CreateJobExecution;
use ciwi_core::ports::{JobExecutionRepository, ProjectRepository};
use ciwi_core::project::{PersistedChain, PersistedPipeline, Project};
use ciwi_core::source::{ReportFn, ResolvedVersion, no_report};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Response of a pipeline or chain run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub job_execution_ids: Vec<JobExecutionId>,
}

/// Version a run would use, for the preview endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPreview {
    pub pipeline_id: String,
    pub version: String,
    pub version_raw: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_ref_resolved: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,
}

pub struct EnqueueService {
    projects: Arc<dyn ProjectRepository>,
    jobs: Arc<dyn JobExecutionRepository>,
    expander: PipelineExpander,
}

impl EnqueueService {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        jobs: Arc<dyn JobExecutionRepository>,
        expander: PipelineExpander,
    ) -> Self {
        Self {
            projects,
            jobs,
            expander,
        }
    }

    async fn pipeline(&self, id: PipelineDbId) -> Result<(Project, PersistedPipeline)> {
        let pipeline = self
            .projects
            .get_pipeline(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("pipeline {id} not found")))?;
        let project = self.project(&pipeline.project_name, pipeline.project_id).await?;
        Ok((project, pipeline))
    }

    async fn project(&self, name: &str, id: ciwi_core::ids::ProjectId) -> Result<Project> {
        self.projects
            .get_project(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project {name} not found")))
    }

    async fn persist(&self, pending: &[CreateJobExecution]) -> Result<Vec<JobExecutionId>> {
        for job in pending {
            job.validate()?;
        }
        let created = self.jobs.create_batch(pending, Utc::now()).await?;
        Ok(created.into_iter().map(|j| j.id).collect())
    }

    pub async fn run_pipeline(
        &self,
        id: PipelineDbId,
        selection: &Selection,
    ) -> Result<EnqueueResponse> {
        let (project, pipeline) = self.pipeline(id).await?;
        let expansion = self
            .expander
            .expand(&project, &pipeline, selection, None)
            .await?;
        let ids = self.persist(&expansion.pending).await?;

        info!(
            project = %project.name,
            pipeline_id = %expansion.pipeline_id,
            pipeline_run_id = %expansion.pipeline_run_id,
            version = %expansion.version.tagged,
            jobs = ids.len(),
            dry_run = selection.dry_run,
            "enqueued pipeline run"
        );
        Ok(EnqueueResponse {
            project: project.name,
            pipeline_id: Some(expansion.pipeline_id),
            pipeline_run_id: Some(expansion.pipeline_run_id),
            pipeline_chain_id: None,
            chain_run_id: None,
            version: expansion.version.tagged,
            job_execution_ids: ids,
        })
    }

    pub async fn run_chain(&self, id: ChainDbId, selection: &Selection) -> Result<EnqueueResponse> {
        let chain = self
            .projects
            .get_chain(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("pipeline chain {id} not found")))?;
        let project = self.project(&chain.project_name, chain.project_id).await?;
        let members = self.chain_members(&chain).await?;

        let expansion = expand_chain(&self.expander, &project, &chain, &members, selection).await?;
        let ids = self.persist(&expansion.pending).await?;

        info!(
            project = %project.name,
            pipeline_chain_id = %expansion.chain_id,
            chain_run_id = %expansion.chain_run_id,
            pipelines = expansion.runs.len(),
            jobs = ids.len(),
            "enqueued chain run"
        );
        Ok(EnqueueResponse {
            project: project.name,
            pipeline_id: None,
            pipeline_run_id: None,
            pipeline_chain_id: Some(expansion.chain_id),
            chain_run_id: Some(expansion.chain_run_id),
            version: expansion.version,
            job_execution_ids: ids,
        })
    }

    async fn chain_members(&self, chain: &PersistedChain) -> Result<Vec<PersistedPipeline>> {
        let mut members = Vec::with_capacity(chain.pipelines.len());
        for pipeline_id in &chain.pipelines {
            let pipeline = self
                .projects
                .get_pipeline_by_name(chain.project_id, pipeline_id)
                .await?
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "pipeline {pipeline_id} of chain {} not found",
                        chain.chain_id
                    ))
                })?;
            members.push(pipeline);
        }
        Ok(members)
    }

    /// Resolve the version of a pipeline, reporting each sub-step.
    pub async fn resolve_version(
        &self,
        id: PipelineDbId,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion> {
        let (project, pipeline) = self.pipeline(id).await?;
        self.expander.preview_version(&project, &pipeline, report).await
    }

    pub async fn version_preview(&self, id: PipelineDbId) -> Result<VersionPreview> {
        let (project, pipeline) = self.pipeline(id).await?;
        let version = self
            .expander
            .preview_version(&project, &pipeline, &no_report)
            .await?;
        let next_version = pipeline
            .spec
            .versioning
            .as_ref()
            .and_then(|v| v.auto_bump)
            .and_then(|mode| mode.bump(&version.raw));
        Ok(VersionPreview {
            pipeline_id: pipeline.pipeline_id,
            version: version.tagged,
            version_raw: version.raw,
            source_ref_resolved: version.source_ref_resolved,
            next_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::run_id::RunIdGenerator;
    use async_trait::async_trait;
    use ciwi_core::config::ProjectConfig;
    use ciwi_core::metadata;
    use ciwi_core::ports::{JobListFilter, SourceRepository};
    use ciwi_core::project::ProjectImport;
    use ciwi_core::source::{FetchedFile, ResolveEvent, ResolveStatus, ResolveStep, VersionRequest};
    use ciwi_db::{Database, SqliteJobExecutionRepository, SqliteProjectRepository};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
version: 1
project:
  name: widget
pipelines:
  - id: build
    source:
      repo: https://git.example.com/widget.git
      ref: main
    versioning:
      file: VERSION
      tag_prefix: v
    jobs:
      - id: compile
        runs_on: { os: linux }
        matrix:
          include:
            - name: linux-amd64
              goarch: amd64
            - name: linux-arm64
              goarch: arm64
        artifacts: ["dist/widget-{ciwi.version}-{goarch}"]
        steps:
          - run: GOARCH={goarch} make VERSION={ciwi.version_raw}
          - name: publish
            run: ./publish.sh
            skip_dry_run: true
pipeline_chains:
  - id: release
    pipelines: [build]
"#;

    struct FixedVersion {
        requests: Mutex<Vec<VersionRequest>>,
    }

    #[async_trait]
    impl SourceRepository for FixedVersion {
        async fn resolve_version(
            &self,
            request: &VersionRequest,
            report: ReportFn<'_>,
        ) -> Result<ResolvedVersion> {
            self.requests.lock().unwrap().push(request.clone());
            report(ResolveEvent::new(ResolveStep::Version, ResolveStatus::Ok, "1.4.0"));
            Ok(ResolvedVersion {
                raw: "1.4.0".into(),
                tagged: format!("{}1.4.0", request.tag_prefix),
                tag_prefix: request.tag_prefix.clone(),
                source_ref_resolved: "c".repeat(40),
            })
        }

        async fn read_file(&self, _: &str, _: &str, _: &str) -> Result<FetchedFile> {
            Err(Error::upstream("not used"))
        }
    }

    const TWO_STAGE_CONFIG: &str = r#"
version: 1
project:
  name: gadget
pipelines:
  - id: build
    source:
      repo: https://git.example.com/gadget.git
      ref: main
    versioning:
      file: VERSION
      tag_prefix: v
    jobs:
      - id: compile
        steps:
          - run: make
  - id: package
    depends_on: [build]
    source:
      repo: https://git.example.com/gadget.git
      ref: main
    jobs:
      - id: bundle
        steps:
          - run: make package
pipeline_chains:
  - id: ship
    pipelines: [build, package]
"#;

    struct Harness {
        service: EnqueueService,
        jobs: Arc<dyn JobExecutionRepository>,
        source: Arc<FixedVersion>,
        pipeline: PipelineDbId,
        chain: ChainDbId,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        harness_with(CONFIG).await
    }

    async fn harness_with(config: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("ciwi.db")).await.unwrap();
        let projects = Arc::new(SqliteProjectRepository::new(db.clone()));
        let detail = projects
            .upsert_project(&ProjectImport {
                repo_url: String::new(),
                repo_ref: String::new(),
                config_path: "ciwi-project.yaml".into(),
                loaded_commit: String::new(),
                config: ProjectConfig::from_yaml(config).unwrap(),
            })
            .await
            .unwrap();
        let jobs: Arc<dyn JobExecutionRepository> = Arc::new(SqliteJobExecutionRepository::new(db));
        let source = Arc::new(FixedVersion {
            requests: Mutex::new(Vec::new()),
        });
        let expander = PipelineExpander::new(
            jobs.clone(),
            source.clone(),
            Arc::new(RunIdGenerator::new()),
            SchedulerConfig::default(),
        );
        Harness {
            service: EnqueueService::new(projects, jobs.clone(), expander),
            jobs,
            source,
            pipeline: detail.pipelines[0].id,
            chain: detail.chains[0].id,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_run_pipeline_fans_out_matrix() {
        let h = harness().await;
        let response = h
            .service
            .run_pipeline(h.pipeline, &Selection::default())
            .await
            .unwrap();
        assert_eq!(response.version, "v1.4.0");
        assert_eq!(response.job_execution_ids.len(), 2);

        let jobs = h.jobs.list(&JobListFilter::default()).await.unwrap();
        let run_ids: Vec<_> = jobs.iter().map(|j| j.meta(metadata::PIPELINE_RUN_ID)).collect();
        assert!(run_ids.iter().all(|r| *r == run_ids[0]));
        let amd = &jobs[0];
        assert_eq!(amd.meta(metadata::MATRIX_NAME), Some("linux-amd64"));
        assert_eq!(amd.meta(metadata::PIPELINE_VERSION), Some("v1.4.0"));
        assert_eq!(amd.artifact_globs, vec!["dist/widget-v1.4.0-amd64"]);
        assert!(amd.script.contains("GOARCH=amd64 make VERSION=1.4.0"));
        assert!(amd.script.contains("./publish.sh"));
        assert_eq!(amd.required_capabilities["os"], "linux");
        assert_eq!(amd.source.as_ref().unwrap().git_ref, "c".repeat(40));
    }

    #[tokio::test]
    async fn test_dry_run_replaces_skipped_steps() {
        let h = harness().await;
        let selection = Selection {
            matrix_name: Some("linux-arm64".into()),
            ..Selection::dry_run()
        };
        let response = h.service.run_pipeline(h.pipeline, &selection).await.unwrap();
        assert_eq!(response.job_execution_ids.len(), 1);

        let job = h.jobs.get(response.job_execution_ids[0]).await.unwrap().unwrap();
        assert_eq!(job.meta(metadata::DRY_RUN), Some("1"));
        assert_eq!(job.env["CIWI_DRY_RUN"], "1");
        assert!(!job.script.contains("publish.sh"));
        assert_eq!(
            job.step_plan[1].kind,
            ciwi_core::job::StepKind::DryrunSkip
        );
    }

    #[tokio::test]
    async fn test_unknown_matrix_entry_matches_nothing() {
        let h = harness().await;
        let selection = Selection {
            matrix_name: Some("windows".into()),
            ..Default::default()
        };
        let err = h.service.run_pipeline(h.pipeline, &selection).await.unwrap_err();
        assert_eq!(err.to_string(), "selection matched no matrix entries");
    }

    #[tokio::test]
    async fn test_single_member_chain_and_preview() {
        let h = harness().await;
        let response = h.service.run_chain(h.chain, &Selection::default()).await.unwrap();
        assert!(response.chain_run_id.as_deref().unwrap().starts_with("chain-"));
        let job = h.jobs.get(response.job_execution_ids[0]).await.unwrap().unwrap();
        assert_eq!(job.meta(metadata::PIPELINE_CHAIN_POSITION), Some("1"));
        assert!(!job.is_blocked());

        let preview = h.service.version_preview(h.pipeline).await.unwrap();
        assert_eq!(preview.version, "v1.4.0");
        assert_eq!(preview.next_version, None);

        let events = Mutex::new(Vec::new());
        let report = |e: ResolveEvent| events.lock().unwrap().push(e);
        h.service.resolve_version(h.pipeline, &report).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_with_ref_override_builds_one_commit() {
        let h = harness_with(TWO_STAGE_CONFIG).await;
        let selection = Selection {
            source_ref: Some("feature/x".into()),
            ..Default::default()
        };
        let response = h.service.run_chain(h.chain, &selection).await.unwrap();
        assert_eq!(response.version, "v1.4.0");
        assert_eq!(response.job_execution_ids.len(), 2);

        let requests = h.source.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].git_ref, "feature/x");

        let commit = "c".repeat(40);
        for id in &response.job_execution_ids {
            let job = h.jobs.get(*id).await.unwrap().unwrap();
            assert_eq!(job.source.as_ref().unwrap().git_ref, commit, "{:?}", job.meta(metadata::PIPELINE_ID));
            assert_eq!(job.meta(metadata::PIPELINE_SOURCE_REF_RESOLVED), Some(commit.as_str()));
            assert_eq!(job.meta(metadata::PIPELINE_VERSION), Some("v1.4.0"));
        }
    }
}
