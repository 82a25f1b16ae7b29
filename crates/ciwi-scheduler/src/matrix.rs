//! Matrix expansion and token rendering.

use ciwi_core::config::JobSpec;
use std::collections::BTreeMap;

/// One cell of an expanded matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixCell {
    pub index: usize,
    /// Value of the entry's `name` variable, empty without a matrix.
    pub name: String,
    pub variables: BTreeMap<String, String>,
}

impl MatrixCell {
    pub fn display_name(&self, job_id: &str) -> String {
        if self.name.is_empty() {
            job_id.to_string()
        } else {
            format!("{job_id} ({})", self.name)
        }
    }
}

/// Version values exposed to templates as `{ciwi.*}` tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionTokens {
    pub version_raw: String,
    pub version: String,
    pub tag_prefix: String,
}

/// Expander for `matrix.include` lists.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// One cell per `include` entry, or a single empty cell without a matrix.
    pub fn expand(&self, job: &JobSpec) -> Vec<MatrixCell> {
        let entries = job
            .matrix
            .as_ref()
            .map(|m| m.include.as_slice())
            .unwrap_or_default();
        if entries.is_empty() {
            return vec![MatrixCell {
                index: 0,
                name: String::new(),
                variables: BTreeMap::new(),
            }];
        }
        entries
            .iter()
            .enumerate()
            .map(|(index, vars)| MatrixCell {
                index,
                name: vars.get("name").cloned().unwrap_or_default(),
                variables: vars.clone(),
            })
            .collect()
    }

    /// Template variables for one cell: the matrix entry plus version tokens.
    pub fn variables(&self, cell: &MatrixCell, version: &VersionTokens) -> BTreeMap<String, String> {
        let mut vars = cell.variables.clone();
        vars.entry("name".to_string())
            .or_insert_with(|| cell.name.clone());
        vars.insert("ciwi.version_raw".into(), version.version_raw.clone());
        vars.insert("ciwi.version".into(), version.version.clone());
        vars.insert("ciwi.tag_prefix".into(), version.tag_prefix.clone());
        vars
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace every `{key}` token whose key is in `vars`. Other braces,
/// including shell `${VAR}` references to unknown keys, are left alone.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if vars.contains_key(&after[..end]) => {
                out.push_str(&vars[&after[..end]]);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
