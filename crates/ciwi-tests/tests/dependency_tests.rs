//! Dependency context resolution against earlier runs.

use chrono::{Duration, Utc};
use ciwi_core::ErrorKind;
use ciwi_core::metadata;
use ciwi_scheduler::Selection;
use ciwi_tests::TestContext;
use ciwi_tests::fixtures::{DEPENDENT_PIPELINES, JobFixture, linux};

/// Record an older run of `build` and a newer one; the older finishes with
/// `older_ok`, the newer with `newer_ok`.
async fn seed_build_runs(ctx: &TestContext, older_ok: bool, newer_ok: bool) -> Vec<String> {
    let now = Utc::now();
    let older = ctx
        .jobs
        .create_batch(
            &[JobFixture::pipeline_run("deps", "build", "run-old", "1.2.3")],
            now - Duration::minutes(10),
        )
        .await
        .unwrap();
    let newer = ctx
        .jobs
        .create_batch(
            &[JobFixture::pipeline_run("deps", "build", "run-new", "1.2.4")],
            now - Duration::minutes(5),
        )
        .await
        .unwrap();

    for (job, ok) in [(&older[0], older_ok), (&newer[0], newer_ok)] {
        let leased = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
        assert_eq!(leased.id, job.id);
        if ok {
            ctx.succeed(job.id, "agent-1").await.unwrap();
        } else {
            ctx.fail(job.id, "agent-1", "tests failed").await.unwrap();
        }
    }
    vec![older[0].id.to_string(), newer[0].id.to_string()]
}

#[tokio::test]
async fn test_latest_failed_run_blocks_dependent() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(DEPENDENT_PIPELINES).await.unwrap();
    seed_build_runs(&ctx, true, false).await;

    let deploy = TestContext::pipeline(&detail, "deploy").unwrap();
    let err = ctx
        .state
        .enqueue
        .run_pipeline(deploy, &Selection::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert!(err.to_string().contains("run-new did not succeed"), "{err}");
    assert!(ctx.executions_of("deploy").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dependent_inherits_latest_successful_run() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(DEPENDENT_PIPELINES).await.unwrap();
    let ids = seed_build_runs(&ctx, false, true).await;

    let deploy = TestContext::pipeline(&detail, "deploy").unwrap();
    let response = ctx
        .state
        .enqueue
        .run_pipeline(deploy, &Selection::default())
        .await
        .unwrap();
    assert_eq!(response.version, "v1.2.4");

    let job = ctx.only_execution_of("deploy").await.unwrap();
    assert_eq!(job.meta(metadata::PIPELINE_VERSION), Some("v1.2.4"));
    assert_eq!(
        job.env.get("CIWI_DEP_ARTIFACT_JOB_ID").map(String::as_str),
        Some(ids[1].as_str())
    );
}

#[tokio::test]
async fn test_dependent_without_upstream_runs_is_rejected() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(DEPENDENT_PIPELINES).await.unwrap();
    let deploy = TestContext::pipeline(&detail, "deploy").unwrap();

    let err = ctx
        .state
        .enqueue
        .run_pipeline(deploy, &Selection::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "dependency pipeline build has no runs");
}
