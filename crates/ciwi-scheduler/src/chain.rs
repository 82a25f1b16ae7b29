//! Chain expansion.
//!
//! Each member pipeline is expanded in order. Its chain-level dependencies
//! are the declared `depends_on` entries that are also chain members, or the
//! previous member when the pipeline declares none. Members with dependencies
//! start blocked; the runtime unblocks them as upstreams succeed.

use crate::dag::DagBuilder;
use crate::dependency::DependencyContext;
use crate::expand::{PipelineExpander, Selection};
use ciwi_core::config::PipelineSpec;
use ciwi_core::job::CreateJobExecution;
use ciwi_core::metadata::{self, FLAG_SET};
use ciwi_core::project::{PersistedChain, PersistedPipeline, Project};
use ciwi_core::{Error, Result};
use tracing::debug;

/// Chain-level dependencies of every member, in member order.
pub fn chain_dependencies(members: &[&PipelineSpec]) -> Result<Vec<Vec<String>>> {
    let ids: Vec<&str> = members.iter().map(|p| p.id.as_str()).collect();
    let mut deps = Vec::with_capacity(members.len());
    for (pos, member) in members.iter().enumerate() {
        let own: Vec<String> = if member.depends_on.is_empty() {
            pos.checked_sub(1)
                .map(|prev| vec![ids[prev].to_string()])
                .unwrap_or_default()
        } else {
            member
                .depends_on
                .iter()
                .filter(|d| ids.contains(&d.as_str()))
                .cloned()
                .collect()
        };
        for dep in &own {
            let dep_pos = ids.iter().position(|id| *id == dep.as_str()).unwrap_or(pos);
            if dep_pos >= pos {
                return Err(Error::constraint(format!(
                    "pipeline {} depends on {dep}, which runs later in the chain",
                    member.id
                )));
            }
        }
        deps.push(own);
    }

    ids.iter()
        .zip(&deps)
        .fold(DagBuilder::new(), |b, (id, d)| b.node(*id, d.iter().cloned()))
        .build()?;
    Ok(deps)
}

/// Output of expanding a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainExpansion {
    pub chain_id: String,
    pub chain_run_id: String,
    /// `(pipeline_id, pipeline_run_id)` per member.
    pub runs: Vec<(String, String)>,
    pub version: String,
    pub pending: Vec<CreateJobExecution>,
}

/// Expand every member of `chain` into one batch of pending jobs.
pub async fn expand_chain(
    expander: &PipelineExpander,
    project: &Project,
    chain: &PersistedChain,
    members: &[PersistedPipeline],
    selection: &Selection,
) -> Result<ChainExpansion> {
    if members.is_empty() {
        return Err(Error::constraint(format!(
            "pipeline chain {} has no pipelines",
            chain.chain_id
        )));
    }
    let specs: Vec<&PipelineSpec> = members.iter().map(|m| &m.spec).collect();
    let deps = chain_dependencies(&specs)?;
    let chain_run_id = expander.run_ids().chain_run_id();
    let member_selection = selection.for_chain_member();
    let total = members.len();

    let mut forced: Option<DependencyContext> = None;
    let mut runs = Vec::with_capacity(total);
    let mut pending = Vec::new();
    let mut version = String::new();

    for (index, (member, member_deps)) in members.iter().zip(&deps).enumerate() {
        // Later members never look up runs of their upstreams outside this
        // chain run; what they inherit comes from the first member.
        let inherited = match (&forced, index) {
            (Some(ctx), _) => Some(ctx.clone()),
            (None, 0) => None,
            (None, _) => Some(DependencyContext::default()),
        };
        let expansion = expander
            .expand(project, member, &member_selection, inherited.as_ref())
            .await?;

        if forced.is_none() && (expansion.context.has_version() || expansion.context.has_source()) {
            version = expansion.version.tagged.clone();
            forced = Some(expansion.context.clone());
        }

        for mut job in expansion.pending {
            let meta = &mut job.metadata;
            meta.insert(metadata::CHAIN_RUN_ID.into(), chain_run_id.clone());
            meta.insert(metadata::PIPELINE_CHAIN_ID.into(), chain.chain_id.clone());
            meta.insert(metadata::PIPELINE_CHAIN_INDEX.into(), index.to_string());
            meta.insert(metadata::PIPELINE_CHAIN_POSITION.into(), (index + 1).to_string());
            meta.insert(metadata::PIPELINE_CHAIN_TOTAL.into(), total.to_string());
            if !member_deps.is_empty() {
                meta.insert(
                    metadata::CHAIN_DEPENDS_ON_PIPELINES.into(),
                    member_deps.join(","),
                );
                meta.insert(metadata::CHAIN_BLOCKED.into(), FLAG_SET.into());
            }
            job.env
                .insert("CIWI_CHAIN_RUN_ID".into(), chain_run_id.clone());
            pending.push(job);
        }
        runs.push((expansion.pipeline_id, expansion.pipeline_run_id));
    }

    debug!(
        chain_id = %chain.chain_id,
        chain_run_id = %chain_run_id,
        pipelines = total,
        jobs = pending.len(),
        "expanded pipeline chain"
    );

    Ok(ChainExpansion {
        chain_id: chain.chain_id.clone(),
        chain_run_id,
        runs,
        version,
        pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, depends_on: &[&str]) -> PipelineSpec {
        PipelineSpec {
            id: id.into(),
            trigger: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            source: None,
            versioning: None,
            jobs: vec![],
        }
    }

    #[test]
    fn test_linear_chain_uses_previous_member() {
        let build = spec("build", &[]);
        let package = spec("package", &[]);
        let deps = chain_dependencies(&[&build, &package]).unwrap();
        assert_eq!(deps, vec![Vec::<String>::new(), vec!["build".to_string()]]);
    }

    #[test]
    fn test_declared_dependencies_are_intersected_with_members() {
        let build = spec("build", &[]);
        let sign = spec("sign", &["build"]);
        let linux = spec("package-linux", &["sign", "lint"]);
        let macos = spec("package-macos", &["sign"]);
        let release = spec("release", &["package-linux", "package-macos"]);
        let deps = chain_dependencies(&[&build, &sign, &linux, &macos, &release]).unwrap();
        assert_eq!(deps[1], vec!["build"]);
        assert_eq!(deps[2], vec!["sign"]);
        assert_eq!(deps[3], vec!["sign"]);
        assert_eq!(deps[4], vec!["package-linux", "package-macos"]);
    }

    #[test]
    fn test_dependency_on_later_member_is_rejected() {
        let a = spec("a", &["b"]);
        let b = spec("b", &[]);
        let err = chain_dependencies(&[&a, &b]).unwrap_err();
        assert!(err.to_string().contains("runs later"), "{err}");
    }

    #[test]
    fn test_declared_outside_chain_means_no_chain_dependency() {
        let build = spec("build", &[]);
        let docs = spec("docs", &["lint"]);
        let deps = chain_dependencies(&[&build, &docs]).unwrap();
        assert!(deps[1].is_empty());
    }
}
