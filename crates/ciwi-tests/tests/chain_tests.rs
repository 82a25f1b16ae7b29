//! Chain runtime scenarios: unblocking, cancellation and fan-in.

use ciwi_core::job::{JobExecution, JobExecutionStatus};
use ciwi_core::metadata;
use ciwi_scheduler::Selection;
use ciwi_tests::TestContext;
use ciwi_tests::fixtures::{FAN_OUT_CHAIN, LINEAR_CHAIN, linux};

fn blocked(job: &JobExecution) -> bool {
    job.meta_flag(metadata::CHAIN_BLOCKED)
}

#[tokio::test]
async fn test_linear_chain_success_unblocks_successor() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(LINEAR_CHAIN).await.unwrap();
    let chain = TestContext::chain(&detail, "build-package").unwrap();

    let response = ctx
        .state
        .enqueue
        .run_chain(chain, &Selection::default())
        .await
        .unwrap();
    assert_eq!(response.job_execution_ids.len(), 2);

    let package = ctx.only_execution_of("package").await.unwrap();
    assert!(blocked(&package));
    assert_eq!(package.status, JobExecutionStatus::Queued);

    let build = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
    assert_eq!(build.meta(metadata::PIPELINE_ID), Some("build"));
    // The blocked successor is not leasable yet.
    assert!(ctx.lease("agent-2", linux()).await.unwrap().is_none());

    let done = ctx.succeed(build.id, "agent-1").await.unwrap();
    assert_eq!(done.status, JobExecutionStatus::Succeeded);
    assert_eq!(done.output, "ok");

    let package = ctx.job(package.id).await.unwrap();
    assert!(!blocked(&package));
    assert_eq!(package.status, JobExecutionStatus::Queued);

    let leased = ctx.lease("agent-2", linux()).await.unwrap().unwrap();
    assert_eq!(leased.id, package.id);
}

#[tokio::test]
async fn test_linear_chain_failure_cancels_successor() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(LINEAR_CHAIN).await.unwrap();
    let chain = TestContext::chain(&detail, "build-package").unwrap();
    ctx.state
        .enqueue
        .run_chain(chain, &Selection::default())
        .await
        .unwrap();

    let build = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
    ctx.fail(build.id, "agent-1", "boom").await.unwrap();

    let package = ctx.only_execution_of("package").await.unwrap();
    assert_eq!(package.status, JobExecutionStatus::Failed);
    assert!(package.meta_flag(metadata::CHAIN_CANCELLED));
    assert!(
        package
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("upstream pipeline build failed"),
        "{:?}",
        package.error
    );
    assert!(package.leased_by_agent_id.is_none());
    assert!(package.finished_utc.is_some());
}

#[tokio::test]
async fn test_fan_out_and_converge() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(FAN_OUT_CHAIN).await.unwrap();
    let chain = TestContext::chain(&detail, "ship").unwrap();
    ctx.state
        .enqueue
        .run_chain(chain, &Selection::default())
        .await
        .unwrap();

    let packages = ["package-macos", "package-windows", "package-linux"];

    let build = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
    assert_eq!(build.meta(metadata::PIPELINE_ID), Some("build"));
    ctx.succeed(build.id, "agent-1").await.unwrap();

    let sign = ctx.only_execution_of("sign").await.unwrap();
    assert!(!blocked(&sign));
    for pkg in packages {
        assert!(blocked(&ctx.only_execution_of(pkg).await.unwrap()), "{pkg}");
    }

    let leased = ctx.lease("agent-1", linux()).await.unwrap().unwrap();
    assert_eq!(leased.id, sign.id);
    ctx.succeed(sign.id, "agent-1").await.unwrap();

    for pkg in packages {
        assert!(!blocked(&ctx.only_execution_of(pkg).await.unwrap()), "{pkg}");
    }
    assert!(blocked(&ctx.only_execution_of("release").await.unwrap()));

    for (i, pkg) in packages.iter().enumerate() {
        let agent = format!("agent-{}", i + 2);
        let job = ctx.lease(&agent, linux()).await.unwrap().unwrap();
        assert!(packages.contains(&job.meta(metadata::PIPELINE_ID).unwrap_or_default()));
        ctx.succeed(job.id, &agent).await.unwrap();
        let release = ctx.only_execution_of("release").await.unwrap();
        if i + 1 < packages.len() {
            assert!(blocked(&release), "release unblocked after {pkg}");
        }
    }

    let release = ctx.only_execution_of("release").await.unwrap();
    assert!(!blocked(&release));
    assert_eq!(release.status, JobExecutionStatus::Queued);
}

#[tokio::test]
async fn test_chain_members_share_run_metadata() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(FAN_OUT_CHAIN).await.unwrap();
    let chain = TestContext::chain(&detail, "ship").unwrap();
    let response = ctx
        .state
        .enqueue
        .run_chain(chain, &Selection::dry_run())
        .await
        .unwrap();

    let chain_run_id = response.chain_run_id.clone().unwrap();
    let release = ctx.only_execution_of("release").await.unwrap();
    assert_eq!(release.meta(metadata::CHAIN_RUN_ID), Some(chain_run_id.as_str()));
    assert_eq!(release.meta(metadata::PIPELINE_CHAIN_POSITION), Some("6"));
    assert_eq!(release.meta(metadata::PIPELINE_CHAIN_TOTAL), Some("6"));
    assert_eq!(
        release.meta(metadata::CHAIN_DEPENDS_ON_PIPELINES),
        Some("package-macos,package-windows,package-linux")
    );
    assert_eq!(release.env.get("CIWI_DRY_RUN").map(String::as_str), Some("1"));
}
