//! Reserved job execution metadata keys and build summary parsing.

use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, String>;

pub const PROJECT: &str = "project";
pub const PROJECT_ID: &str = "project_id";
pub const PIPELINE_ID: &str = "pipeline_id";
pub const PIPELINE_RUN_ID: &str = "pipeline_run_id";
pub const PIPELINE_JOB_ID: &str = "pipeline_job_id";
pub const PIPELINE_JOB_INDEX: &str = "pipeline_job_index";
pub const MATRIX_INDEX: &str = "matrix_index";
pub const MATRIX_NAME: &str = "matrix_name";
pub const BUILD_TARGET: &str = "build_target";
pub const BUILD_VERSION: &str = "build_version";
pub const PIPELINE_VERSION: &str = "pipeline_version";
pub const PIPELINE_VERSION_RAW: &str = "pipeline_version_raw";
pub const PIPELINE_SOURCE_REPO: &str = "pipeline_source_repo";
pub const PIPELINE_SOURCE_REF_RAW: &str = "pipeline_source_ref_raw";
pub const PIPELINE_SOURCE_REF_RESOLVED: &str = "pipeline_source_ref_resolved";
pub const DRY_RUN: &str = "dry_run";
pub const CHAIN_RUN_ID: &str = "chain_run_id";
pub const PIPELINE_CHAIN_ID: &str = "pipeline_chain_id";
pub const PIPELINE_CHAIN_INDEX: &str = "pipeline_chain_index";
pub const PIPELINE_CHAIN_POSITION: &str = "pipeline_chain_position";
pub const PIPELINE_CHAIN_TOTAL: &str = "pipeline_chain_total";
pub const CHAIN_DEPENDS_ON_PIPELINES: &str = "chain_depends_on_pipelines";
pub const CHAIN_BLOCKED: &str = "chain_blocked";
pub const CHAIN_CANCELLED: &str = "chain_cancelled";
pub const NEEDS_JOB_IDS: &str = "needs_job_ids";
pub const NEEDS_BLOCKED: &str = "needs_blocked";
pub const HAS_SECRETS: &str = "has_secrets";
pub const NEXT_VERSION: &str = "next_version";
pub const AUTO_BUMP_BRANCH: &str = "auto_bump_branch";

pub const ADHOC: &str = "adhoc";
pub const ADHOC_AGENT_ID: &str = "adhoc_agent_id";
pub const DEP_ARTIFACT_JOB_IDS: &str = "dep_artifact_job_ids";
pub const EXECUTION_MODE: &str = "execution_mode";
/// Container runtime hints lifted out of `runs_on`.
pub const CONTAINER_PREFIX: &str = "container.";

pub const BUILD_SUMMARY_MARKER: &str = "__CIWI_BUILD_SUMMARY__";
pub const RELEASE_SUMMARY_MARKER: &str = "__CIWI_RELEASE_SUMMARY__";

pub const FLAG_SET: &str = "1";

pub fn get<'a>(meta: &'a Metadata, key: &str) -> Option<&'a str> {
    meta.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// True if the flag is present and set to `1` or `true`.
pub fn flag(meta: &Metadata, key: &str) -> bool {
    matches!(meta.get(key).map(|v| v.trim()), Some("1" | "true"))
}

/// Split a comma-separated list value, dropping empty entries.
pub fn list(meta: &Metadata, key: &str) -> Vec<String> {
    meta.get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Scan output for summary marker lines and collect the derived metadata.
///
/// `version` and `target` from build summaries become `build_version` and
/// `build_target`; `next_version` from release summaries is kept as is. Later
/// lines win. Unrelated output is ignored.
pub fn parse_build_metadata_from_output(output: &str) -> Metadata {
    let mut out = Metadata::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(BUILD_SUMMARY_MARKER) {
            for (key, value) in summary_fields(rest) {
                match key {
                    "version" => {
                        out.insert(BUILD_VERSION.to_string(), value.to_string());
                    }
                    "target" => {
                        out.insert(BUILD_TARGET.to_string(), value.to_string());
                    }
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix(RELEASE_SUMMARY_MARKER) {
            for (key, value) in summary_fields(rest) {
                if key == NEXT_VERSION {
                    out.insert(NEXT_VERSION.to_string(), value.to_string());
                }
            }
        }
    }
    out
}

fn summary_fields(rest: &str) -> impl Iterator<Item = (&str, &str)> {
    // Require a separator so `__CIWI_BUILD_SUMMARY__X` is not accepted.
    let body = if rest.starts_with(char::is_whitespace) { rest } else { "" };
    body.split_whitespace().filter_map(|field| {
        let (k, v) = field.split_once('=')?;
        let v = v.trim_matches('"');
        (!k.is_empty() && !v.is_empty()).then_some((k, v))
    })
}

/// Replace every occurrence of each sensitive value with `***`.
pub fn redact_output(output: &str, sensitive: &[String]) -> String {
    let mut values: Vec<&str> = sensitive
        .iter()
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .collect();
    // Longest first so a value containing another is masked whole.
    values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    let mut redacted = output.to_string();
    for value in values {
        redacted = redacted.replace(value, "***");
    }
    redacted
}
