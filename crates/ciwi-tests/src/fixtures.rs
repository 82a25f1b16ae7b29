//! Project files and job records used by the scenarios.

use chrono::{DateTime, Utc};
use ciwi_core::capability::CapabilityMap;
use ciwi_core::job::CreateJobExecution;
use ciwi_core::metadata::{self, Metadata};

/// Chain `build-package` = `[build, package]`, both on linux.
pub const LINEAR_CHAIN: &str = r#"
version: 1
project:
  name: linear
pipelines:
  - id: build
    jobs:
      - id: compile
        runs_on: { os: linux }
        steps:
          - run: make build
  - id: package
    jobs:
      - id: bundle
        runs_on: { os: linux }
        steps:
          - run: make package
pipeline_chains:
  - id: build-package
    pipelines: [build, package]
"#;

/// Fan-out through `sign` into three packages that converge on `release`.
pub const FAN_OUT_CHAIN: &str = r#"
version: 1
project:
  name: fanout
pipelines:
  - id: build
    jobs:
      - id: compile
        runs_on: { os: linux }
        steps:
          - run: make build
  - id: sign
    depends_on: [build]
    jobs:
      - id: sign
        runs_on: { os: linux }
        steps:
          - run: ./sign.sh
  - id: package-macos
    depends_on: [sign]
    jobs:
      - id: pkg
        runs_on: { os: linux }
        steps:
          - run: ./package.sh macos
  - id: package-windows
    depends_on: [sign]
    jobs:
      - id: pkg
        runs_on: { os: linux }
        steps:
          - run: ./package.sh windows
  - id: package-linux
    depends_on: [sign]
    jobs:
      - id: pkg
        runs_on: { os: linux }
        steps:
          - run: ./package.sh linux
  - id: release
    depends_on: [package-macos, package-windows, package-linux]
    jobs:
      - id: publish
        runs_on: { os: linux }
        steps:
          - run: ./release.sh
pipeline_chains:
  - id: ship
    pipelines: [build, sign, package-macos, package-windows, package-linux, release]
"#;

/// `smoke` fans out over two linux variants; `package` needs it.
pub const MATRIX_NEEDS: &str = r#"
version: 1
project:
  name: needs
pipelines:
  - id: verify
    jobs:
      - id: smoke
        runs_on: { os: linux }
        matrix:
          include:
            - name: linux-a
              flavor: a
            - name: linux-b
              flavor: b
        steps:
          - run: ./smoke.sh {flavor}
      - id: package
        needs: [smoke]
        runs_on: { os: linux }
        steps:
          - run: ./package.sh
"#;

/// `deploy` consumes the latest run of `build`.
pub const DEPENDENT_PIPELINES: &str = r#"
version: 1
project:
  name: deps
pipelines:
  - id: build
    jobs:
      - id: compile
        runs_on: { os: linux }
        steps:
          - run: make build
  - id: deploy
    depends_on: [build]
    jobs:
      - id: rollout
        runs_on: { os: linux }
        steps:
          - run: ./deploy.sh
"#;

/// Versioned release pipeline that bumps its own version file.
pub const AUTO_BUMP_RELEASE: &str = r#"
version: 1
project:
  name: bumper
  vault:
    connection: home-vault
    secrets:
      - name: github-token
        path: ci/github
        key: token
pipelines:
  - id: release
    source:
      repo: https://git.example.com/bumper.git
      ref: main
    versioning:
      file: VERSION
      tag_prefix: v
      auto_bump: patch
      auto_bump_vcs_token: github-token
    jobs:
      - id: publish
        runs_on: { os: linux }
        steps:
          - run: ./publish.sh {ciwi.version}
"#;

pub fn linux() -> CapabilityMap {
    CapabilityMap::from([("os".to_string(), "linux".to_string())])
}

/// Factory for job records created directly in the store.
pub struct JobFixture;

impl JobFixture {
    /// A single linux job with the given timeout.
    pub fn linux(timeout_seconds: u64) -> CreateJobExecution {
        CreateJobExecution {
            script: "echo hello".to_string(),
            env: Default::default(),
            required_capabilities: linux(),
            timeout_seconds,
            artifact_globs: Vec::new(),
            caches: Vec::new(),
            source: None,
            step_plan: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// A job belonging to run `run_id` of `pipeline_id` at `version`.
    pub fn pipeline_run(
        project: &str,
        pipeline_id: &str,
        run_id: &str,
        version: &str,
    ) -> CreateJobExecution {
        let mut job = Self::linux(600);
        let meta = &mut job.metadata;
        meta.insert(metadata::PROJECT.into(), project.into());
        meta.insert(metadata::PIPELINE_ID.into(), pipeline_id.into());
        meta.insert(metadata::PIPELINE_RUN_ID.into(), run_id.into());
        meta.insert(metadata::PIPELINE_JOB_ID.into(), "compile".into());
        meta.insert(metadata::PIPELINE_VERSION_RAW.into(), version.into());
        meta.insert(metadata::PIPELINE_VERSION.into(), format!("v{version}"));
        job
    }
}

/// Fixed instant used where a scenario advances a clock.
pub fn epoch(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_760_000_000 + seconds, 0).unwrap_or_default()
}
