//! Version bump step appended to release pipelines.

use ciwi_core::config::BumpMode;

/// Environment variable the bump step reads its push token from.
pub const AUTO_BUMP_TOKEN_ENV: &str = "CIWI_AUTO_BUMP_TOKEN";
pub const AUTO_BUMP_STEP_NAME: &str = "auto-bump";

const SCRIPT_HEAD: &str = r#"set -eu
if [ "${CIWI_DRY_RUN:-}" = "1" ]; then
  echo "[auto-bump] dry run: version bump skipped"
  exit 0
fi
CURRENT="${CIWI_PIPELINE_VERSION_RAW:?CIWI_PIPELINE_VERSION_RAW is not set}"
VERSION_FILE="${CIWI_PIPELINE_VERSION_FILE:-VERSION}"
MAJOR="$(printf '%s' "$CURRENT" | cut -d. -f1)"
MINOR="$(printf '%s' "$CURRENT" | cut -d. -f2)"
PATCH="$(printf '%s' "$CURRENT" | cut -d. -f3)"
"#;

const SCRIPT_TAIL: &str = r#"NEXT="${MAJOR}.${MINOR}.${PATCH}"
BRANCH="${CIWI_PIPELINE_SOURCE_REF_RAW:-}"
BRANCH="${BRANCH#refs/heads/}"
if [ -z "$BRANCH" ] || printf '%s' "$BRANCH" | grep -Eq '^[0-9a-fA-F]{40}$'; then
  BRANCH="$(git symbolic-ref --quiet --short refs/remotes/origin/HEAD || true)"
  BRANCH="${BRANCH#origin/}"
fi
if [ -z "$BRANCH" ]; then
  echo "auto bump cannot determine the release branch" >&2
  exit 1
fi
if [ -n "${CIWI_AUTO_BUMP_TOKEN:-}" ]; then
  AUTH="$(printf 'x-access-token:%s' "$CIWI_AUTO_BUMP_TOKEN" | base64 | tr -d '\n')"
  git config http.extraheader "Authorization: Basic ${AUTH}"
fi
printf '%s\n' "$NEXT" > "$VERSION_FILE"
git add -- "$VERSION_FILE"
git -c user.name="${CIWI_AUTO_BUMP_AUTHOR:-ciwi}" -c user.email="${CIWI_AUTO_BUMP_EMAIL:-ciwi@localhost}" \
  commit -m "chore: bump ${VERSION_FILE} to ${NEXT} [skip ci]"
if ! git push origin "HEAD:refs/heads/${BRANCH}"; then
  echo "auto bump push failed; branch ${BRANCH} advanced during release" >&2
  exit 1
fi
echo "__CIWI_RELEASE_SUMMARY__ next_version=${NEXT}"
"#;

/// POSIX shell snippet that bumps the version file and pushes the commit
/// back to the branch the release was built from.
pub fn build_auto_bump_step_script(mode: BumpMode) -> String {
    let bump = match mode {
        BumpMode::Patch => "PATCH=$((PATCH + 1))\n",
        BumpMode::Minor => "MINOR=$((MINOR + 1))\nPATCH=0\n",
        BumpMode::Major => "MAJOR=$((MAJOR + 1))\nMINOR=0\nPATCH=0\n",
    };
    let mut script = String::with_capacity(SCRIPT_HEAD.len() + bump.len() + SCRIPT_TAIL.len());
    script.push_str(SCRIPT_HEAD);
    script.push_str(bump);
    script.push_str(SCRIPT_TAIL);
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_script_pushes_to_resolved_branch() {
        let script = build_auto_bump_step_script(BumpMode::Patch);
        assert!(script.contains(r#"git push origin "HEAD:refs/heads/${BRANCH}""#));
        assert!(script.contains("git symbolic-ref --quiet --short refs/remotes/origin/HEAD"));
        assert!(!script.contains(r#"BRANCH="main""#));
        assert!(script.contains("PATCH=$((PATCH + 1))"));
        assert!(script.contains("__CIWI_RELEASE_SUMMARY__ next_version="));
    }

    #[test]
    fn test_minor_and_major_zero_lower_components() {
        let minor = build_auto_bump_step_script(BumpMode::Minor);
        assert!(minor.contains("MINOR=$((MINOR + 1))\nPATCH=0\n"));
        let major = build_auto_bump_step_script(BumpMode::Major);
        assert!(major.contains("MAJOR=$((MAJOR + 1))\nMINOR=0\nPATCH=0\n"));
    }

    #[test]
    fn test_commit_message_and_advance_failure_text() {
        let script = build_auto_bump_step_script(BumpMode::Patch);
        assert!(script.contains("chore: bump ${VERSION_FILE} to ${NEXT} [skip ci]"));
        assert!(script.contains("auto bump push failed; branch ${BRANCH} advanced during release"));
    }
}
