//! Intra-pipeline `needs` scenarios.

use ciwi_core::ErrorKind;
use ciwi_core::job::{JobExecution, JobExecutionStatus};
use ciwi_core::metadata;
use ciwi_scheduler::Selection;
use ciwi_tests::TestContext;
use ciwi_tests::fixtures::{MATRIX_NEEDS, linux};

struct Run {
    smoke_a: (JobExecution, &'static str),
    smoke_b: (JobExecution, &'static str),
    package: JobExecution,
}

async fn enqueue_and_lease_smoke(ctx: &TestContext) -> Run {
    let detail = ctx.load_project(MATRIX_NEEDS).await.unwrap();
    let pipeline = TestContext::pipeline(&detail, "verify").unwrap();
    let response = ctx
        .state
        .enqueue
        .run_pipeline(pipeline, &Selection::default())
        .await
        .unwrap();
    assert_eq!(response.job_execution_ids.len(), 3);

    let first = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
    let second = ctx.lease("agent-2", linux()).await.unwrap().unwrap();
    // `package` waits for both smoke variants.
    assert!(ctx.lease("agent-3", linux()).await.unwrap().is_none());

    let (smoke_a, smoke_b) = if first.meta(metadata::MATRIX_NAME) == Some("linux-a") {
        ((first, "agent-1"), (second, "agent-2"))
    } else {
        ((second, "agent-2"), (first, "agent-1"))
    };
    assert_eq!(smoke_b.0.meta(metadata::MATRIX_NAME), Some("linux-b"));

    let package = ctx
        .executions_of("verify")
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.meta(metadata::PIPELINE_JOB_ID) == Some("package"))
        .unwrap();
    assert!(package.meta_flag(metadata::NEEDS_BLOCKED));

    Run {
        smoke_a,
        smoke_b,
        package,
    }
}

#[tokio::test]
async fn test_failed_matrix_variant_cancels_dependent() {
    let ctx = TestContext::new().await.unwrap();
    let run = enqueue_and_lease_smoke(&ctx).await;

    let (smoke_a, agent_a) = &run.smoke_a;
    let (smoke_b, agent_b) = &run.smoke_b;
    ctx.fail(smoke_a.id, agent_a, "smoke failed on a")
        .await
        .unwrap();
    // Still blocked while linux-b runs.
    let package = ctx.job(run.package.id).await.unwrap();
    assert_eq!(package.status, JobExecutionStatus::Queued);

    ctx.succeed(smoke_b.id, agent_b).await.unwrap();

    let package = ctx.job(run.package.id).await.unwrap();
    assert_eq!(package.status, JobExecutionStatus::Failed);
    assert!(
        package
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("required job smoke failed"),
        "{:?}",
        package.error
    );
}

#[tokio::test]
async fn test_all_variants_succeeding_unblocks_dependent() {
    let ctx = TestContext::new().await.unwrap();
    let run = enqueue_and_lease_smoke(&ctx).await;

    let (smoke_a, agent_a) = &run.smoke_a;
    let (smoke_b, agent_b) = &run.smoke_b;
    ctx.succeed(smoke_a.id, agent_a).await.unwrap();
    assert!(
        ctx.job(run.package.id)
            .await
            .unwrap()
            .meta_flag(metadata::NEEDS_BLOCKED)
    );
    ctx.succeed(smoke_b.id, agent_b).await.unwrap();

    let package = ctx.job(run.package.id).await.unwrap();
    assert!(!package.meta_flag(metadata::NEEDS_BLOCKED));
    assert_eq!(package.status, JobExecutionStatus::Queued);

    let leased = ctx.lease("agent-3", linux()).await.unwrap().unwrap();
    assert_eq!(leased.id, package.id);
}

#[tokio::test]
async fn test_selection_excluding_need_is_rejected() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(MATRIX_NEEDS).await.unwrap();
    let pipeline = TestContext::pipeline(&detail, "verify").unwrap();

    let selection = Selection {
        pipeline_job_id: Some("package".into()),
        ..Default::default()
    };
    let err = ctx
        .state
        .enqueue
        .run_pipeline(pipeline, &selection)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert_eq!(
        err.to_string(),
        r#"selection excludes required job "smoke" needed by "package""#
    );
    assert!(ctx.executions_of("verify").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleting_queued_run_leaves_no_blocked_residue() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(MATRIX_NEEDS).await.unwrap();
    let pipeline = TestContext::pipeline(&detail, "verify").unwrap();
    ctx.state
        .enqueue
        .run_pipeline(pipeline, &Selection::default())
        .await
        .unwrap();

    for job in ctx.executions_of("verify").await.unwrap() {
        ctx.state.jobs.delete_queued(job.id).await.unwrap();
    }
    assert!(ctx.executions_of("verify").await.unwrap().is_empty());
    let summary = ctx.jobs.summary().await.unwrap();
    assert_eq!(summary.queued, 0);
}
