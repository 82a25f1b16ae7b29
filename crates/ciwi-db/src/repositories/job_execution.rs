//! SQLite implementation of JobExecutionRepository.

use crate::{Database, db_err, from_json, from_ms, opt_from_ms, to_json, to_ms};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ciwi_core::artifact::{Artifact, StoredTestReport, TestReport};
use ciwi_core::capability::{CapabilityMap, match_requirements};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{
    CreateJobExecution, JobExecution, JobExecutionStatus, JobStatusUpdate, JobSummary,
    is_synthetic_owner,
};
use ciwi_core::metadata::{self, parse_build_metadata_from_output, redact_output};
use ciwi_core::ports::{JobExecutionRepository, JobListFilter, LeaseOutcome, QueuedPatch};
use ciwi_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

const COLUMNS: &str = "id, script, env, required_capabilities, timeout_seconds, artifact_globs, caches, source, step_plan, metadata, current_step, status, created_ms, started_ms, finished_ms, leased_by_agent_id, leased_ms, exit_code, error, output, sensitive_values";

/// SQL predicate selecting queued rows that are not held back by a chain or
/// `needs` dependency.
const UNBLOCKED: &str = "COALESCE(json_extract(metadata, '$.chain_blocked'), '') NOT IN ('1', 'true') \
     AND COALESCE(json_extract(metadata, '$.needs_blocked'), '') NOT IN ('1', 'true')";

/// SQLite implementation of JobExecutionRepository.
pub struct SqliteJobExecutionRepository {
    db: Database,
}

impl SqliteJobExecutionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn status_from_str(raw: &str) -> Result<JobExecutionStatus> {
        JobExecutionStatus::normalize(raw)
            .map_err(|_| Error::Database(format!("unknown stored job status {raw:?}")))
    }

    fn row_to_job(r: &SqliteRow) -> Result<JobExecution> {
        let id: String = r.get("id");
        let id: JobExecutionId = id
            .parse()
            .map_err(|e| Error::Database(format!("invalid job execution id {id:?}: {e}")))?;
        let source: Option<String> = r.get("source");

        Ok(JobExecution {
            id,
            script: r.get("script"),
            env: from_json(&r.get::<String, _>("env"))?,
            required_capabilities: from_json(&r.get::<String, _>("required_capabilities"))?,
            timeout_seconds: r.get::<i64, _>("timeout_seconds").max(0) as u64,
            artifact_globs: from_json(&r.get::<String, _>("artifact_globs"))?,
            caches: from_json(&r.get::<String, _>("caches"))?,
            source: source.as_deref().map(from_json).transpose()?,
            step_plan: from_json(&r.get::<String, _>("step_plan"))?,
            metadata: from_json(&r.get::<String, _>("metadata"))?,
            current_step: r.get("current_step"),
            status: Self::status_from_str(&r.get::<String, _>("status"))?,
            created_utc: from_ms(r.get("created_ms")),
            started_utc: opt_from_ms(r.get("started_ms")),
            finished_utc: opt_from_ms(r.get("finished_ms")),
            leased_by_agent_id: r.get("leased_by_agent_id"),
            leased_utc: opt_from_ms(r.get("leased_ms")),
            exit_code: r.get::<Option<i64>, _>("exit_code").map(|c| c as i32),
            error: r.get("error"),
            output: r.get("output"),
            sensitive_values: from_json(&r.get::<String, _>("sensitive_values"))?,
        })
    }

    async fn fetch_in(conn: &mut SqliteConnection, id: JobExecutionId) -> Result<JobExecution> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_executions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => Self::row_to_job(&r),
            None => Err(Error::not_found(format!("job execution {id} not found"))),
        }
    }

    /// Write back every mutable column of `job`.
    async fn save_in(conn: &mut SqliteConnection, job: &JobExecution) -> Result<()> {
        sqlx::query(
            r#"UPDATE job_executions
               SET env = ?, step_plan = ?, metadata = ?, current_step = ?, status = ?,
                   started_ms = ?, finished_ms = ?, leased_by_agent_id = ?, leased_ms = ?,
                   exit_code = ?, error = ?, output = ?, sensitive_values = ?
               WHERE id = ?"#,
        )
        .bind(to_json(&job.env)?)
        .bind(to_json(&job.step_plan)?)
        .bind(to_json(&job.metadata)?)
        .bind(&job.current_step)
        .bind(job.status.as_str())
        .bind(job.started_utc.map(to_ms))
        .bind(job.finished_utc.map(to_ms))
        .bind(&job.leased_by_agent_id)
        .bind(job.leased_utc.map(to_ms))
        .bind(job.exit_code.map(i64::from))
        .bind(&job.error)
        .bind(&job.output)
        .bind(to_json(&job.sensitive_values)?)
        .bind(job.id.to_string())
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn fetch_where(&self, clause: &str, binds: &[&str]) -> Result<Vec<JobExecution>> {
        let sql = format!("SELECT {COLUMNS} FROM job_executions WHERE {clause}");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(self.db.pool()).await.map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }
}

/// Apply a status report to an in-memory snapshot.
///
/// Output reported by an agent replaces the stored output; output from a
/// synthetic owner is appended as control lines.
fn apply_status_update(
    job: &mut JobExecution,
    update: &JobStatusUpdate,
    now: DateTime<Utc>,
) -> Result<()> {
    let next = JobExecutionStatus::normalize(&update.status)?;
    let agent_id = update.agent_id.trim();
    if agent_id.is_empty() {
        return Err(Error::invalid("agent_id is required"));
    }
    if job.status.is_terminal() {
        return Err(Error::AlreadyTerminal(job.id.to_string()));
    }

    if is_synthetic_owner(agent_id) {
        if next != JobExecutionStatus::Failed {
            return Err(Error::invalid(format!(
                "{agent_id} may only fail job executions"
            )));
        }
    } else {
        if !next.is_reportable() {
            return Err(Error::invalid(format!(
                "status {next} cannot be reported by an agent"
            )));
        }
        match job.leased_by_agent_id.as_deref() {
            Some(owner) if owner == agent_id && job.status.is_active() => {}
            Some(owner) => {
                return Err(Error::ConflictOwnership(format!(
                    "job execution {} is leased by {owner}, not {agent_id}",
                    job.id
                )));
            }
            None => {
                return Err(Error::ConflictOwnership(format!(
                    "job execution {} is not leased",
                    job.id
                )));
            }
        }
    }

    if let Some(output) = &update.output {
        if is_synthetic_owner(agent_id) {
            if !job.output.is_empty() && !job.output.ends_with('\n') {
                job.output.push('\n');
            }
            job.output.push_str(output.trim_end());
            job.output.push('\n');
        } else {
            job.output = redact_output(output, &job.sensitive_values);
            job.metadata
                .extend(parse_build_metadata_from_output(&job.output));
        }
    }
    if let Some(step) = &update.current_step {
        job.current_step = step.clone();
    }
    if update.exit_code.is_some() {
        job.exit_code = update.exit_code;
    }
    if let Some(error) = update.error.as_deref().filter(|e| !e.trim().is_empty()) {
        job.error = Some(redact_output(error, &job.sensitive_values));
    }

    match next {
        JobExecutionStatus::Running => {
            job.status = JobExecutionStatus::Running;
            job.started_utc.get_or_insert(now);
        }
        JobExecutionStatus::Succeeded | JobExecutionStatus::Failed => {
            job.status = next;
            job.finished_utc = Some(now);
            job.leased_by_agent_id = None;
            job.leased_utc = None;
        }
        JobExecutionStatus::Queued | JobExecutionStatus::Leased => {
            return Err(Error::invalid(format!("status {next} cannot be reported")));
        }
    }
    Ok(())
}

#[async_trait]
impl JobExecutionRepository for SqliteJobExecutionRepository {
    async fn create_batch(
        &self,
        jobs: &[CreateJobExecution],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>> {
        for job in jobs {
            job.validate()?;
        }

        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = JobExecutionId::new();
            sqlx::query(
                r#"INSERT INTO job_executions
                   (id, script, env, required_capabilities, timeout_seconds, artifact_globs, caches,
                    source, step_plan, metadata, status, created_ms)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?)"#,
            )
            .bind(id.to_string())
            .bind(&job.script)
            .bind(to_json(&job.env)?)
            .bind(to_json(&job.required_capabilities)?)
            .bind(job.timeout_seconds as i64)
            .bind(to_json(&job.artifact_globs)?)
            .bind(to_json(&job.caches)?)
            .bind(job.source.as_ref().map(to_json).transpose()?)
            .bind(to_json(&job.step_plan)?)
            .bind(to_json(&job.metadata)?)
            .bind(to_ms(now))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            created.push(Self::fetch_in(&mut tx, id).await?);
        }
        tx.commit().await.map_err(db_err)?;
        drop(guard);

        tracing::debug!(count = created.len(), "created job executions");
        Ok(created)
    }

    async fn get(&self, id: JobExecutionId) -> Result<Option<JobExecution>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM job_executions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self, filter: &JobListFilter) -> Result<Vec<JobExecution>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM job_executions WHERE 1 = 1"));
        if !filter.statuses.is_empty() {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in &filter.statuses {
                sep.push_bind(status.as_str());
            }
            sep.push_unseparated(")");
        }
        for (key, value) in &filter.metadata {
            qb.push(" AND json_extract(metadata, ")
                .push_bind(format!("$.\"{key}\""))
                .push(") = ")
                .push_bind(value.clone());
        }
        if filter.newest_first {
            qb.push(" ORDER BY created_ms DESC, id DESC");
        } else {
            qb.push(" ORDER BY created_ms ASC, id ASC");
        }
        qb.push(" LIMIT ")
            .push_bind(filter.limit.map(i64::from).unwrap_or(-1))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = qb
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn summary(&self) -> Result<JobSummary> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_executions GROUP BY status")
            .fetch_all(self.db.pool())
            .await
            .map_err(db_err)?;

        let mut summary = JobSummary::default();
        for r in &rows {
            let status = Self::status_from_str(&r.get::<String, _>("status"))?;
            summary.add(status, r.get::<i64, _>("n").max(0) as u64);
        }
        Ok(summary)
    }

    async fn lease_next(
        &self,
        agent_id: &str,
        capabilities: &CapabilityMap,
        now: DateTime<Utc>,
    ) -> Result<LeaseOutcome> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_executions WHERE status = 'queued' AND {UNBLOCKED} ORDER BY created_ms ASC, id ASC"
        ))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        if rows.is_empty() {
            return Ok(LeaseOutcome::NoneQueued);
        }

        let mut first_reason = None;
        let mut chosen = None;
        for r in &rows {
            let job = Self::row_to_job(r)?;
            match match_requirements(&job.required_capabilities, capabilities) {
                Ok(()) => {
                    chosen = Some(job);
                    break;
                }
                Err(reason) => {
                    first_reason.get_or_insert(reason);
                }
            }
        }

        let Some(mut job) = chosen else {
            let reason = first_reason.unwrap_or_default();
            return Ok(LeaseOutcome::NoMatch {
                reason: format!(
                    "no queued job matches agent capabilities ({} queued; {reason})",
                    rows.len()
                ),
            });
        };

        job.status = JobExecutionStatus::Leased;
        job.leased_by_agent_id = Some(agent_id.to_string());
        job.leased_utc = Some(now);
        Self::save_in(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        drop(guard);

        tracing::info!(job_execution_id = %job.id, agent_id, "leased job execution");
        Ok(LeaseOutcome::Leased(Box::new(job)))
    }

    async fn update_status(
        &self,
        id: JobExecutionId,
        update: &JobStatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let mut job = Self::fetch_in(&mut tx, id).await?;
        let previous = job.status;
        apply_status_update(&mut job, update, now)?;
        Self::save_in(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        drop(guard);

        if previous != job.status {
            tracing::info!(
                job_execution_id = %id,
                agent_id = %update.agent_id,
                from = %previous,
                to = %job.status,
                "job execution status changed"
            );
        }
        Ok(job)
    }

    async fn record_sensitive_values(&self, id: JobExecutionId, values: &[String]) -> Result<()> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let mut job = Self::fetch_in(&mut tx, id).await?;
        for value in values.iter().filter(|v| !v.is_empty()) {
            if !job.sensitive_values.contains(value) {
                job.sensitive_values.push(value.clone());
            }
        }
        job.metadata
            .insert(metadata::HAS_SECRETS.to_string(), metadata::FLAG_SET.to_string());
        Self::save_in(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        drop(guard);
        Ok(())
    }

    async fn patch_queued(
        &self,
        id: JobExecutionId,
        patch: &QueuedPatch,
    ) -> Result<Option<JobExecution>> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let mut job = Self::fetch_in(&mut tx, id).await?;
        if job.status != JobExecutionStatus::Queued {
            return Ok(None);
        }
        for key in &patch.remove_metadata {
            job.metadata.remove(key);
        }
        job.metadata
            .extend(patch.set_metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        job.env
            .extend(patch.set_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self::save_in(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        drop(guard);
        Ok(Some(job))
    }

    async fn delete_queued(&self, id: JobExecutionId) -> Result<()> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let job = Self::fetch_in(&mut tx, id).await?;
        if job.status != JobExecutionStatus::Queued {
            return Err(Error::ConflictOwnership(format!(
                "job execution {id} is {}; only queued executions can be deleted",
                job.status
            )));
        }
        sqlx::query("DELETE FROM job_executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        drop(guard);

        tracing::info!(job_execution_id = %id, "deleted queued job execution");
        Ok(())
    }

    async fn clear_queued(&self) -> Result<u64> {
        let _guard = self.db.write_lock().await;
        let result = sqlx::query("DELETE FROM job_executions WHERE status = 'queued'")
            .execute(self.db.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn flush_history(&self) -> Result<u64> {
        let _guard = self.db.write_lock().await;
        let result =
            sqlx::query("DELETE FROM job_executions WHERE status IN ('succeeded', 'failed')")
                .execute(self.db.pool())
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn requeue_stale_leased(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64> {
        let _guard = self.db.write_lock().await;
        let result = sqlx::query(
            r#"UPDATE job_executions
               SET status = 'queued', leased_by_agent_id = NULL, leased_ms = NULL
               WHERE status = 'leased' AND leased_ms IS NOT NULL AND leased_ms + ? < ?"#,
        )
        .bind(stale_after.num_milliseconds())
        .bind(to_ms(now))
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn fail_timed_out_running(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
        marker: &str,
    ) -> Result<Vec<JobExecution>> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM job_executions \
             WHERE status = 'running' AND started_ms IS NOT NULL \
             AND started_ms + timeout_seconds * 1000 + ? <= ?"
        ))
        .bind(grace.num_milliseconds())
        .bind(to_ms(now))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut failed = Vec::with_capacity(rows.len());
        for r in &rows {
            let mut job = Self::row_to_job(r)?;
            job.status = JobExecutionStatus::Failed;
            job.finished_utc = Some(now);
            job.leased_by_agent_id = None;
            job.leased_utc = None;
            job.error = Some(format!(
                "job timed out after {}s while running",
                job.timeout_seconds
            ));
            if !job.output.is_empty() && !job.output.ends_with('\n') {
                job.output.push('\n');
            }
            job.output.push_str(marker);
            Self::save_in(&mut tx, &job).await?;
            failed.push(job);
        }
        tx.commit().await.map_err(db_err)?;
        drop(guard);
        Ok(failed)
    }

    async fn latest_pipeline_run(
        &self,
        project: &str,
        pipeline_id: &str,
    ) -> Result<Vec<JobExecution>> {
        let run_id: Option<String> = sqlx::query_scalar(
            r#"SELECT json_extract(metadata, '$.pipeline_run_id') AS run_id
               FROM job_executions
               WHERE json_extract(metadata, '$.project') = ?
                 AND json_extract(metadata, '$.pipeline_id') = ?
                 AND COALESCE(json_extract(metadata, '$.pipeline_run_id'), '') <> ''
               GROUP BY run_id
               ORDER BY MAX(created_ms) DESC, run_id DESC
               LIMIT 1"#,
        )
        .bind(project)
        .bind(pipeline_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        let Some(run_id) = run_id else {
            return Ok(Vec::new());
        };
        self.fetch_where(
            "json_extract(metadata, '$.pipeline_run_id') = ? ORDER BY created_ms, id",
            &[run_id.as_str()],
        )
        .await
    }

    async fn latest_succeeded_with_source(
        &self,
        project: &str,
        pipeline_id: &str,
    ) -> Result<Option<JobExecution>> {
        let mut jobs = self
            .fetch_where(
                "status = 'succeeded' \
                 AND json_extract(metadata, '$.project') = ? \
                 AND json_extract(metadata, '$.pipeline_id') = ? \
                 AND COALESCE(json_extract(metadata, '$.pipeline_source_ref_resolved'), '') <> '' \
                 ORDER BY created_ms DESC, id DESC LIMIT 1",
                &[project, pipeline_id],
            )
            .await?;
        Ok(jobs.pop())
    }

    async fn has_active_for_agent(&self, agent_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM job_executions WHERE status IN ('leased', 'running') AND leased_by_agent_id = ? LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn add_artifacts(&self, artifacts: &[Artifact]) -> Result<()> {
        let guard = self.db.write_lock().await;
        let mut tx = self.db.pool().begin().await.map_err(db_err)?;
        for artifact in artifacts {
            sqlx::query(
                r#"INSERT INTO job_artifacts (job_execution_id, path, size_bytes, url, content_type, created_ms)
                   VALUES (?, ?, ?, ?, ?, ?)
                   ON CONFLICT (job_execution_id, path) DO UPDATE SET
                     size_bytes = excluded.size_bytes,
                     url = excluded.url,
                     content_type = excluded.content_type,
                     created_ms = excluded.created_ms"#,
            )
            .bind(artifact.job_execution_id.to_string())
            .bind(&artifact.path)
            .bind(artifact.size_bytes as i64)
            .bind(&artifact.url)
            .bind(&artifact.content_type)
            .bind(to_ms(artifact.created_utc))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        drop(guard);
        Ok(())
    }

    async fn list_artifacts(&self, id: JobExecutionId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT path, size_bytes, url, content_type, created_ms FROM job_artifacts WHERE job_execution_id = ? ORDER BY path",
        )
        .bind(id.to_string())
        .fetch_all(self.db.pool())
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| Artifact {
                job_execution_id: id,
                path: r.get("path"),
                size_bytes: r.get::<i64, _>("size_bytes").max(0) as u64,
                url: r.get("url"),
                content_type: r.get("content_type"),
                created_utc: from_ms(r.get("created_ms")),
            })
            .collect())
    }

    async fn save_test_report(
        &self,
        id: JobExecutionId,
        report: &TestReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.db.write_lock().await;
        sqlx::query(
            r#"INSERT INTO job_test_reports (job_execution_id, report, created_ms)
               VALUES (?, ?, ?)
               ON CONFLICT (job_execution_id) DO UPDATE SET
                 report = excluded.report, created_ms = excluded.created_ms"#,
        )
        .bind(id.to_string())
        .bind(to_json(report)?)
        .bind(to_ms(now))
        .execute(self.db.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_test_report(&self, id: JobExecutionId) -> Result<Option<StoredTestReport>> {
        let row = sqlx::query(
            "SELECT report, created_ms FROM job_test_reports WHERE job_execution_id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_err)?;

        row.map(|r| {
            Ok(StoredTestReport {
                job_execution_id: id,
                report: from_json(&r.get::<String, _>("report"))?,
                created_utc: from_ms(r.get("created_ms")),
            })
        })
        .transpose()
    }
}
