//! Structural validation of a parsed project configuration.

use crate::dag::{DagBuilder, DagError};
use ciwi_core::Error;
use ciwi_core::config::{PipelineSpec, ProjectConfig};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("project name is required")]
    MissingProjectName,
    #[error("unsupported project config version {0}")]
    UnsupportedVersion(u32),
    #[error("pipeline id is required")]
    MissingPipelineId,
    #[error("duplicate pipeline id {0:?}")]
    DuplicatePipeline(String),
    #[error("pipeline {pipeline:?} has duplicate job id {job:?}")]
    DuplicateJob { pipeline: String, job: String },
    #[error("pipeline {0:?} has no jobs")]
    EmptyPipeline(String),
    #[error("pipeline {pipeline:?} job {job:?}: {reason}")]
    InvalidJob {
        pipeline: String,
        job: String,
        reason: String,
    },
    #[error("pipeline {pipeline:?} job needs: {source}")]
    Needs {
        pipeline: String,
        #[source]
        source: DagError,
    },
    #[error("pipeline depends_on: {0}")]
    DependsOn(#[source] DagError),
    #[error("pipeline {pipeline:?}: {reason}")]
    InvalidVersioning { pipeline: String, reason: String },
    #[error("duplicate pipeline chain id {0:?}")]
    DuplicateChain(String),
    #[error("pipeline chain {chain:?}: {reason}")]
    InvalidChain { chain: String, reason: String },
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::invalid(err.to_string())
    }
}

/// Check a project configuration before it is persisted.
pub fn validate_project_config(config: &ProjectConfig) -> Result<(), ConfigError> {
    if config.project.name.trim().is_empty() {
        return Err(ConfigError::MissingProjectName);
    }
    if config.version != 1 {
        return Err(ConfigError::UnsupportedVersion(config.version));
    }

    let mut pipeline_ids = HashSet::new();
    for pipeline in &config.pipelines {
        if !pipeline_ids.insert(pipeline.id.as_str()) {
            return Err(ConfigError::DuplicatePipeline(pipeline.id.clone()));
        }
        validate_pipeline(pipeline)?;
    }

    config
        .pipelines
        .iter()
        .fold(DagBuilder::new(), |b, p| b.node(p.id.clone(), p.depends_on.iter().cloned()))
        .build()
        .map_err(ConfigError::DependsOn)?;

    let mut chain_ids = HashSet::new();
    for chain in &config.pipeline_chains {
        if !chain_ids.insert(chain.id.as_str()) {
            return Err(ConfigError::DuplicateChain(chain.id.clone()));
        }
        if chain.pipelines.is_empty() {
            return Err(ConfigError::InvalidChain {
                chain: chain.id.clone(),
                reason: "no pipelines".into(),
            });
        }
        let mut seen = HashSet::new();
        for member in &chain.pipelines {
            if !pipeline_ids.contains(member.as_str()) {
                return Err(ConfigError::InvalidChain {
                    chain: chain.id.clone(),
                    reason: format!("unknown pipeline {member:?}"),
                });
            }
            if !seen.insert(member.as_str()) {
                return Err(ConfigError::InvalidChain {
                    chain: chain.id.clone(),
                    reason: format!("pipeline {member:?} listed twice"),
                });
            }
        }
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineSpec) -> Result<(), ConfigError> {
    if pipeline.id.trim().is_empty() {
        return Err(ConfigError::MissingPipelineId);
    }
    if pipeline.jobs.is_empty() {
        return Err(ConfigError::EmptyPipeline(pipeline.id.clone()));
    }

    let mut job_ids = HashSet::new();
    for job in &pipeline.jobs {
        if !job_ids.insert(job.id.as_str()) {
            return Err(ConfigError::DuplicateJob {
                pipeline: pipeline.id.clone(),
                job: job.id.clone(),
            });
        }
        let invalid = |reason: String| ConfigError::InvalidJob {
            pipeline: pipeline.id.clone(),
            job: job.id.clone(),
            reason,
        };
        if job.id.trim().is_empty() {
            return Err(invalid("job id is required".into()));
        }
        if job.steps.is_empty() {
            return Err(invalid("no steps".into()));
        }
        if job.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds must be positive".into()));
        }
        for (i, step) in job.steps.iter().enumerate() {
            match (&step.run, &step.test) {
                (Some(run), None) if !run.trim().is_empty() => {}
                (None, Some(test)) if !test.command.trim().is_empty() => {}
                (Some(_), Some(_)) => {
                    return Err(invalid(format!("step {} sets both run and test", i + 1)));
                }
                _ => return Err(invalid(format!("step {} has nothing to run", i + 1))),
            }
        }
        if let Some(matrix) = &job.matrix {
            let mut names = HashSet::new();
            for entry in &matrix.include {
                if let Some(name) = entry.get("name")
                    && !names.insert(name.as_str())
                {
                    return Err(invalid(format!("duplicate matrix entry {name:?}")));
                }
            }
        }
    }

    pipeline
        .jobs
        .iter()
        .fold(DagBuilder::new(), |b, j| b.node(j.id.clone(), j.needs.iter().cloned()))
        .build()
        .map_err(|source| ConfigError::Needs {
            pipeline: pipeline.id.clone(),
            source,
        })?;

    if let Some(versioning) = &pipeline.versioning {
        let file = versioning.version_file();
        if file.starts_with('/') || file.split(['/', '\\']).any(|part| part == "..") {
            return Err(ConfigError::InvalidVersioning {
                pipeline: pipeline.id.clone(),
                reason: format!("version file {file:?} must be a relative path inside the repository"),
            });
        }
        if pipeline.source_repo().is_none() {
            return Err(ConfigError::InvalidVersioning {
                pipeline: pipeline.id.clone(),
                reason: "versioning requires a source repo".into(),
            });
        }
    }
    Ok(())
}
