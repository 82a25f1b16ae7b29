//! Job execution lifecycle: status reports, user operations and listings.

use crate::runtime::DependencyRuntime;
use chrono::Utc;
use ciwi_core::artifact::{Artifact, StoredTestReport, TestReport};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{
    JobExecution, JobExecutionStatus, JobStatusUpdate, JobSummary, JobView, SERVER_CONTROL_AGENT,
};
use ciwi_core::ports::{JobExecutionRepository, JobListFilter};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Page size used when a listing does not ask for one.
pub const DEFAULT_LIST_LIMIT: u32 = 200;
/// Upper bound on rows returned by one listing.
pub const MAX_LIST_LIMIT: u32 = 1000;

pub const FORCE_FAIL_ERROR: &str = "force-failed";
pub const FORCE_FAIL_MARKER: &str = "[control] job force-failed by user";

/// Parameters of `GET /jobs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListQuery {
    #[serde(default)]
    pub view: JobView,
    /// Hard cap on the rows returned, applied after `limit`.
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl JobListQuery {
    fn effective_limit(&self) -> u32 {
        let limit = self.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_LIST_LIMIT);
        let max = self.max.filter(|m| *m > 0).unwrap_or(MAX_LIST_LIMIT);
        limit.min(max).min(MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub view: JobView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<JobSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_executions: Option<Vec<JobExecution>>,
}

/// Drives job executions through their state machine.
pub struct JobService {
    jobs: Arc<dyn JobExecutionRepository>,
    runtime: Arc<DependencyRuntime>,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobExecutionRepository>, runtime: Arc<DependencyRuntime>) -> Self {
        Self { jobs, runtime }
    }

    pub async fn get(&self, id: JobExecutionId) -> Result<JobExecution> {
        self.jobs
            .get(id)
            .await?
            .map(JobExecution::redacted)
            .ok_or_else(|| Error::not_found(format!("job execution {id} not found")))
    }

    /// Apply a status report and propagate terminal states to dependents.
    pub async fn update_status(
        &self,
        id: JobExecutionId,
        update: &JobStatusUpdate,
    ) -> Result<JobExecution> {
        let job = self.jobs.update_status(id, update, Utc::now()).await?;
        self.runtime.on_job_updated(&job).await?;
        Ok(job.redacted())
    }

    /// Fail a non-terminal execution on behalf of a user.
    pub async fn force_fail(&self, id: JobExecutionId) -> Result<JobExecution> {
        let mut update = JobStatusUpdate::failed_by(SERVER_CONTROL_AGENT, FORCE_FAIL_ERROR);
        update.output = Some(FORCE_FAIL_MARKER.to_string());
        let job = self.update_status(id, &update).await?;
        info!(job_execution_id = %id, "job execution force-failed");
        Ok(job)
    }

    pub async fn delete_queued(&self, id: JobExecutionId) -> Result<()> {
        self.jobs.delete_queued(id).await
    }

    pub async fn clear_queue(&self) -> Result<u64> {
        let removed = self.jobs.clear_queued().await?;
        if removed > 0 {
            warn!(removed, "queue cleared");
        }
        Ok(removed)
    }

    pub async fn flush_history(&self) -> Result<u64> {
        let removed = self.jobs.flush_history().await?;
        info!(removed, "job history flushed");
        Ok(removed)
    }

    pub async fn list(&self, query: &JobListQuery) -> Result<JobListing> {
        let mut filter = JobListFilter {
            limit: Some(query.effective_limit()),
            offset: query.offset.unwrap_or(0),
            ..Default::default()
        };
        match query.view {
            JobView::Summary => {
                return Ok(JobListing {
                    view: JobView::Summary,
                    summary: Some(self.jobs.summary().await?),
                    job_executions: None,
                });
            }
            JobView::Queued => {
                filter.statuses = JobExecutionStatus::ALL
                    .into_iter()
                    .filter(|s| !s.is_terminal())
                    .collect();
            }
            JobView::History => {
                filter.statuses = vec![JobExecutionStatus::Succeeded, JobExecutionStatus::Failed];
                filter.newest_first = true;
            }
        }
        let jobs = self.jobs.list(&filter).await?;
        Ok(JobListing {
            view: query.view,
            summary: None,
            job_executions: Some(jobs.into_iter().map(JobExecution::redacted).collect()),
        })
    }

    /// Record artifacts already written to disk by the caller.
    pub async fn add_artifacts(&self, id: JobExecutionId, artifacts: &[Artifact]) -> Result<()> {
        self.require(id).await?;
        self.jobs.add_artifacts(artifacts).await
    }

    pub async fn artifacts(&self, id: JobExecutionId) -> Result<Vec<Artifact>> {
        self.require(id).await?;
        self.jobs.list_artifacts(id).await
    }

    pub async fn save_test_report(&self, id: JobExecutionId, report: &TestReport) -> Result<()> {
        report.validate()?;
        self.require(id).await?;
        self.jobs.save_test_report(id, report, Utc::now()).await
    }

    pub async fn test_report(&self, id: JobExecutionId) -> Result<StoredTestReport> {
        self.require(id).await?;
        self.jobs
            .get_test_report(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job execution {id} has no test report")))
    }

    async fn require(&self, id: JobExecutionId) -> Result<JobExecution> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job execution {id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciwi_core::job::CreateJobExecution;
    use ciwi_core::ports::LeaseOutcome;
    use ciwi_db::{Database, SqliteJobExecutionRepository};
    use tempfile::TempDir;

    async fn service() -> (JobService, Arc<dyn JobExecutionRepository>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("ciwi.db")).await.unwrap();
        let jobs: Arc<dyn JobExecutionRepository> = Arc::new(SqliteJobExecutionRepository::new(db));
        let runtime = Arc::new(DependencyRuntime::new(jobs.clone()));
        (JobService::new(jobs.clone(), runtime), jobs, dir)
    }

    fn pending() -> CreateJobExecution {
        CreateJobExecution {
            script: "make\n".into(),
            timeout_seconds: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_force_fail_queued_job() {
        let (service, jobs, _dir) = service().await;
        let created = jobs.create_batch(&[pending()], Utc::now()).await.unwrap();

        let failed = service.force_fail(created[0].id).await.unwrap();
        assert_eq!(failed.status, JobExecutionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(FORCE_FAIL_ERROR));
        assert!(failed.output.contains(FORCE_FAIL_MARKER));

        let again = service.force_fail(created[0].id).await.unwrap_err();
        assert!(matches!(again, Error::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn test_list_views() {
        let (service, jobs, _dir) = service().await;
        let created = jobs
            .create_batch(&[pending(), pending(), pending()], Utc::now())
            .await
            .unwrap();
        service.force_fail(created[0].id).await.unwrap();

        let summary = service.list(&JobListQuery::default()).await.unwrap();
        let counts = summary.summary.unwrap();
        assert_eq!((counts.queued, counts.failed), (2, 1));

        let queued = service
            .list(&JobListQuery {
                view: JobView::Queued,
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let rows = queued.job_executions.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, created[1].id);

        let history = service
            .list(&JobListQuery {
                view: JobView::History,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(history.job_executions.unwrap()[0].id, created[0].id);
    }

    #[tokio::test]
    async fn test_delete_requires_queued() {
        let (service, jobs, _dir) = service().await;
        let created = jobs.create_batch(&[pending()], Utc::now()).await.unwrap();
        let LeaseOutcome::Leased(_) = jobs
            .lease_next("agent-1", &Default::default(), Utc::now())
            .await
            .unwrap()
        else {
            panic!("expected a lease");
        };
        let err = service.delete_queued(created[0].id).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (service, _jobs, _dir) = service().await;
        let err = service.artifacts(JobExecutionId::new()).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::NotFound);
    }
}
