//! On-disk artifact storage under `<artifacts_dir>/<job_id>/<path>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ciwi_core::artifact::{Artifact, ArtifactUpload, validate_artifact_path};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode and write uploads. Every path is validated before anything is
    /// written.
    pub async fn persist(
        &self,
        job_id: JobExecutionId,
        uploads: &[ArtifactUpload],
    ) -> Result<Vec<Artifact>> {
        let mut decoded = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let path = validate_artifact_path(&upload.path)?;
            let data = STANDARD.decode(upload.data_base64.trim()).map_err(|e| {
                Error::invalid(format!("artifact {path}: data_base64 is not valid base64: {e}"))
            })?;
            decoded.push((path, data, upload.content_type.clone()));
        }

        let job_dir = self.root.join(job_id.to_string());
        let mut artifacts = Vec::with_capacity(decoded.len());
        for (path, data, content_type) in decoded {
            let target = job_dir.join(&path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &data).await?;
            debug!(job_execution_id = %job_id, path = %path, bytes = data.len(), "stored artifact");
            artifacts.push(Artifact {
                job_execution_id: job_id,
                url: Artifact::url_for(&job_id, &path),
                path,
                size_bytes: data.len() as u64,
                content_type,
                created_utc: Utc::now(),
            });
        }
        Ok(artifacts)
    }
}
