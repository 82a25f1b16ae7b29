//! Auto-bump script shape and its attachment to release runs.

use ciwi_core::config::BumpMode;
use ciwi_core::job::StepKind;
use ciwi_core::metadata;
use ciwi_scheduler::Selection;
use ciwi_scheduler::autobump::{AUTO_BUMP_STEP_NAME, AUTO_BUMP_TOKEN_ENV, build_auto_bump_step_script};
use ciwi_tests::TestContext;
use ciwi_tests::fixtures::AUTO_BUMP_RELEASE;
use pretty_assertions::assert_eq;

#[test]
fn test_patch_script_shape() {
    let script = build_auto_bump_step_script(BumpMode::Patch);
    assert!(script.contains(r#"git push origin "HEAD:refs/heads/${BRANCH}""#));
    assert!(script.contains("git symbolic-ref --quiet --short refs/remotes/origin/HEAD"));
    assert!(!script.contains(r#"BRANCH="main""#));
    assert!(script.contains("auto bump push failed; branch ${BRANCH} advanced during release"));
}

#[tokio::test]
async fn test_release_run_appends_bump_step() {
    let ctx = TestContext::new().await.unwrap();
    ctx.source.set_version("2.7.9");
    let detail = ctx.load_project(AUTO_BUMP_RELEASE).await.unwrap();
    let release = TestContext::pipeline(&detail, "release").unwrap();

    let response = ctx
        .state
        .enqueue
        .run_pipeline(release, &Selection::default())
        .await
        .unwrap();
    assert_eq!(response.version, "v2.7.9");

    let job = ctx.only_execution_of("release").await.unwrap();
    assert_eq!(job.meta(metadata::NEXT_VERSION), Some("2.7.10"));
    assert_eq!(job.meta(metadata::AUTO_BUMP_BRANCH), Some("main"));
    assert_eq!(
        job.meta(metadata::PIPELINE_SOURCE_REF_RESOLVED),
        Some(ctx.source.commit())
    );

    let bump = job.step_plan.last().unwrap();
    assert_eq!(bump.name, AUTO_BUMP_STEP_NAME);
    assert!(matches!(&bump.kind, StepKind::Run { script } if script.contains("PATCH=$((PATCH + 1))")));
    assert_eq!(
        bump.env.get(AUTO_BUMP_TOKEN_ENV).map(String::as_str),
        Some("{{ secret.github-token }}")
    );
    assert_eq!(bump.vault_connection.as_deref(), Some("home-vault"));
    assert_eq!(bump.secrets[0].name, "github-token");

    let requests = ctx.source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].git_ref, "main");
    assert_eq!(requests[0].version_file, "VERSION");
}

#[tokio::test]
async fn test_dry_run_skips_bump_step() {
    let ctx = TestContext::new().await.unwrap();
    let detail = ctx.load_project(AUTO_BUMP_RELEASE).await.unwrap();
    let release = TestContext::pipeline(&detail, "release").unwrap();

    ctx.state
        .enqueue
        .run_pipeline(release, &Selection::dry_run())
        .await
        .unwrap();

    let job = ctx.only_execution_of("release").await.unwrap();
    assert!(job.step_plan.iter().all(|s| s.name != AUTO_BUMP_STEP_NAME));
    assert_eq!(job.meta(metadata::NEXT_VERSION), None);
}

#[tokio::test]
async fn test_version_failure_fails_expansion() {
    let ctx = TestContext::new().await.unwrap();
    ctx.source.fail_with("VERSION: not found");
    let detail = ctx.load_project(AUTO_BUMP_RELEASE).await.unwrap();
    let release = TestContext::pipeline(&detail, "release").unwrap();

    let err = ctx
        .state
        .enqueue
        .run_pipeline(release, &Selection::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ciwi_core::ErrorKind::Upstream);
    assert!(ctx.executions_of("release").await.unwrap().is_empty());
}
