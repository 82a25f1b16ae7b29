//! Thin wrapper over the `git` CLI.

use crate::error::GitError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Run `git <args>` in `dir` and return trimmed stdout.
///
/// The child is killed if the returned future is dropped, so an outer
/// deadline also stops the process.
pub(crate) async fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let command = args.first().copied().unwrap_or_default().to_string();
    debug!(command = %command, dir = %dir.display(), "running git");

    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "true")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(GitError::CommandFailed { command, stderr });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
