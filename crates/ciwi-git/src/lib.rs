//! Source repository access through the `git` CLI.
//!
//! Every operation works on a fresh shallow checkout in a temporary
//! directory that is removed when the operation ends, whether it succeeded,
//! failed or hit the deadline.

mod command;
mod error;

pub use error::GitError;

use async_trait::async_trait;
use ciwi_core::ports::SourceRepository;
use ciwi_core::source::{
    FetchedFile, ReportFn, ResolveEvent, ResolveStatus, ResolveStep, ResolvedVersion,
    VersionRequest, is_plain_semver,
};
use command::git;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const DEFAULT_GIT_DEADLINE: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct GitConfig {
    /// Upper bound for all git work done by one operation.
    pub deadline: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_GIT_DEADLINE,
        }
    }
}

/// A shallow checkout that lives as long as this value.
struct Checkout {
    dir: TempDir,
    commit: String,
}

impl Checkout {
    fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// [`SourceRepository`] backed by shallow clones.
#[derive(Debug, Clone, Default)]
pub struct GitSourceRepository {
    config: GitConfig,
}

impl GitSourceRepository {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    async fn checkout(&self, repo_url: &str, git_ref: &str) -> Result<Checkout, GitError> {
        let repo_url = repo_url.trim();
        if repo_url.is_empty() {
            return Err(GitError::MissingRepo);
        }
        let git_ref = git_ref.trim();
        if git_ref.starts_with('-') || repo_url.starts_with('-') {
            return Err(GitError::InvalidRef(git_ref.to_string()));
        }
        let dir = tempfile::Builder::new()
            .prefix("ciwi-src-")
            .tempdir()
            .map_err(GitError::TempDir)?;
        let root = dir.path();

        git(root, &["clone", "--quiet", "--depth", "1", "--", repo_url, "."]).await?;
        if !git_ref.is_empty() {
            git(root, &["fetch", "--quiet", "--depth", "1", "origin", git_ref]).await?;
            git(root, &["checkout", "--quiet", "--detach", "FETCH_HEAD"]).await?;
        }
        let commit = git(root, &["rev-parse", "HEAD"]).await?;
        debug!(repo_url, git_ref, commit = %commit, "checked out source");
        Ok(Checkout { dir, commit })
    }

    async fn with_deadline<T>(
        &self,
        work: impl Future<Output = Result<T, GitError>>,
    ) -> Result<T, GitError> {
        tokio::time::timeout(self.config.deadline, work)
            .await
            .map_err(|_| GitError::Timeout(self.config.deadline))?
    }

    async fn resolve(
        &self,
        request: &VersionRequest,
        report: ReportFn<'_>,
    ) -> Result<ResolvedVersion, GitError> {
        report(ResolveEvent::new(
            ResolveStep::Checkout,
            ResolveStatus::Running,
            describe(&request.repo_url, &request.git_ref),
        ));
        let checkout = match self
            .with_deadline(self.checkout(&request.repo_url, &request.git_ref))
            .await
        {
            Ok(checkout) => checkout,
            Err(e) => {
                report(ResolveEvent::new(ResolveStep::Checkout, ResolveStatus::Error, e.to_string()));
                return Err(e);
            }
        };
        report(ResolveEvent::new(
            ResolveStep::Checkout,
            ResolveStatus::Ok,
            checkout.commit.clone(),
        ));

        report(ResolveEvent::new(
            ResolveStep::VersionFile,
            ResolveStatus::Running,
            request.version_file.clone(),
        ));
        let content = match read_inside(checkout.root(), &request.version_file).await {
            Ok(content) => content,
            Err(e) => {
                report(ResolveEvent::new(ResolveStep::VersionFile, ResolveStatus::Error, e.to_string()));
                return Err(e);
            }
        };
        report(ResolveEvent::new(
            ResolveStep::VersionFile,
            ResolveStatus::Ok,
            request.version_file.clone(),
        ));

        report(ResolveEvent::new(ResolveStep::Version, ResolveStatus::Running, ""));
        let raw = match parse_version(&request.version_file, &content) {
            Ok(raw) => raw,
            Err(e) => {
                report(ResolveEvent::new(ResolveStep::Version, ResolveStatus::Error, e.to_string()));
                return Err(e);
            }
        };
        let tagged = format!("{}{raw}", request.tag_prefix);
        report(ResolveEvent::new(ResolveStep::Version, ResolveStatus::Ok, tagged.clone()));

        info!(
            repo_url = %request.repo_url,
            git_ref = %request.git_ref,
            commit = %checkout.commit,
            version = %tagged,
            "resolved pipeline version"
        );
        Ok(ResolvedVersion {
            raw,
            tagged,
            tag_prefix: request.tag_prefix.clone(),
            source_ref_resolved: checkout.commit,
        })
    }
}

#[async_trait]
impl SourceRepository for GitSourceRepository {
    async fn resolve_version(
        &self,
        request: &VersionRequest,
        report: ReportFn<'_>,
    ) -> ciwi_core::Result<ResolvedVersion> {
        self.resolve(request, report).await.map_err(|e| {
            warn!(repo_url = %request.repo_url, error = %e, "version resolution failed");
            e.into()
        })
    }

    async fn read_file(
        &self,
        repo_url: &str,
        git_ref: &str,
        path: &str,
    ) -> ciwi_core::Result<FetchedFile> {
        let fetched = self
            .with_deadline(async {
                let checkout = self.checkout(repo_url, git_ref).await?;
                let content = read_inside(checkout.root(), path).await?;
                Ok::<_, GitError>(FetchedFile {
                    content,
                    commit: checkout.commit,
                })
            })
            .await?;
        Ok(fetched)
    }
}

fn describe(repo_url: &str, git_ref: &str) -> String {
    if git_ref.trim().is_empty() {
        repo_url.to_string()
    } else {
        format!("{repo_url}@{git_ref}")
    }
}

/// Check that `path` is a non-empty relative path without `..` components.
pub fn validate_relative_path(path: &str) -> Result<PathBuf, GitError> {
    let trimmed = path.trim();
    let candidate = Path::new(trimmed);
    let ok = !trimmed.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok {
        return Err(GitError::InvalidPath(path.to_string()));
    }
    Ok(candidate.to_path_buf())
}

/// Read `path` below `root`, refusing paths that resolve outside it.
async fn read_inside(root: &Path, path: &str) -> Result<String, GitError> {
    let relative = validate_relative_path(path)?;
    let read_err = |source| GitError::ReadFile {
        path: path.to_string(),
        source,
    };
    let root = tokio::fs::canonicalize(root).await.map_err(read_err)?;
    let full = tokio::fs::canonicalize(root.join(&relative))
        .await
        .map_err(read_err)?;
    if !full.starts_with(&root) {
        return Err(GitError::InvalidPath(path.to_string()));
    }
    tokio::fs::read_to_string(&full).await.map_err(read_err)
}

/// Trim a version file's content and require `MAJOR.MINOR.PATCH`.
pub fn parse_version(path: &str, content: &str) -> Result<String, GitError> {
    let value = content.trim();
    if !is_plain_semver(value) {
        return Err(GitError::InvalidVersion {
            path: path.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_relative_path_validation() {
        assert!(validate_relative_path("VERSION").is_ok());
        assert!(validate_relative_path("./build/VERSION").is_ok());
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../VERSION").is_err());
        assert!(validate_relative_path("a/../../VERSION").is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("VERSION", " 1.4.0\n").unwrap(), "1.4.0");
        let err = parse_version("VERSION", "v1.4").unwrap_err();
        assert_eq!(
            err.to_string(),
            "version file VERSION contains \"v1.4\", expected MAJOR.MINOR.PATCH"
        );
    }

    #[test]
    fn test_error_kinds() {
        let invalid: ciwi_core::Error = GitError::InvalidPath("../x".into()).into();
        assert_eq!(invalid.kind(), ciwi_core::ErrorKind::InvalidInput);
        let upstream: ciwi_core::Error = GitError::Timeout(DEFAULT_GIT_DEADLINE).into();
        assert_eq!(upstream.kind(), ciwi_core::ErrorKind::Upstream);
        assert_eq!(upstream.to_string(), "git operations timed out after 45s");
    }

    #[tokio::test]
    async fn test_read_inside_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("VERSION"), "1.0.0\n").unwrap();
        assert_eq!(read_inside(dir.path(), "VERSION").await.unwrap(), "1.0.0\n");
        assert!(matches!(
            read_inside(dir.path(), "../VERSION").await,
            Err(GitError::InvalidPath(_))
        ));
        assert!(matches!(
            read_inside(dir.path(), "missing").await,
            Err(GitError::ReadFile { .. })
        ));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn sh_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=ciwi", "-c", "user.email=ciwi@example.com"])
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    /// A local repository with VERSION at 1.2.3, tagged `v1.2.3`, then
    /// bumped to 1.3.0 on the default branch.
    fn origin() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        sh_git(root, &["init", "--quiet"]);
        std::fs::write(root.join("VERSION"), "1.2.3\n").unwrap();
        sh_git(root, &["add", "VERSION"]);
        sh_git(root, &["commit", "--quiet", "-m", "first"]);
        sh_git(root, &["tag", "v1.2.3"]);
        std::fs::write(root.join("VERSION"), "1.3.0\n").unwrap();
        sh_git(root, &["commit", "--quiet", "-am", "bump"]);
        dir
    }

    #[tokio::test]
    async fn test_resolve_version_from_local_repository() {
        if !git_available() {
            return;
        }
        let origin = origin();
        let url = format!("file://{}", origin.path().display());
        let repo = GitSourceRepository::default();
        let events = Mutex::new(Vec::new());
        let report = |e: ResolveEvent| events.lock().unwrap().push(e);

        let head = repo
            .resolve_version(
                &VersionRequest {
                    repo_url: url.clone(),
                    git_ref: String::new(),
                    version_file: "VERSION".into(),
                    tag_prefix: "v".into(),
                },
                &report,
            )
            .await
            .unwrap();
        assert_eq!(head.raw, "1.3.0");
        assert_eq!(head.tagged, "v1.3.0");
        assert_eq!(head.source_ref_resolved.len(), 40);

        let events = events.into_inner().unwrap();
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.status != ResolveStatus::Error));

        let tagged = repo
            .resolve_version(
                &VersionRequest {
                    repo_url: url,
                    git_ref: "v1.2.3".into(),
                    version_file: "VERSION".into(),
                    tag_prefix: String::new(),
                },
                &ciwi_core::source::no_report,
            )
            .await
            .unwrap();
        assert_eq!(tagged.raw, "1.2.3");
        assert_ne!(tagged.source_ref_resolved, head.source_ref_resolved);
    }

    #[tokio::test]
    async fn test_read_file_reports_missing_file() {
        if !git_available() {
            return;
        }
        let origin = origin();
        let url = format!("file://{}", origin.path().display());
        let repo = GitSourceRepository::default();

        let fetched = repo.read_file(&url, "", "VERSION").await.unwrap();
        assert_eq!(fetched.content, "1.3.0\n");
        let err = repo.read_file(&url, "", "ciwi-project.yaml").await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Upstream);
    }
}
