//! Diff text and `--shortstat` summaries.

use super::{branch::validate_branch_name, git};
use crate::error::GitError;
use crate::sandbox::{shell_quote, SandboxSession};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Summary of a diff; all zero when there are no changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDiffStats {
    pub files: u64,
    pub additions: u64,
    pub deletions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutput {
    Empty,
    Text(String),
    /// Larger than the requested cutoff; only the size is reported.
    TooLarge { chars: usize },
}

static SHORTSTAT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(\d+) files? changed(?:, (\d+) insertions?\(\+\))?(?:, (\d+) deletions?\(-\))?")
        .ok()
});

/// Parse `git diff --shortstat` output. Singular and plural forms are both
/// accepted; anything unrecognised yields zeroes.
pub fn parse_git_shortstat(text: &str) -> GitDiffStats {
    let Some(caps) = SHORTSTAT.as_ref().and_then(|re| re.captures(text)) else {
        return GitDiffStats::default();
    };
    let num = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    GitDiffStats {
        files: num(1),
        additions: num(2),
        deletions: num(3),
    }
}

/// The commit to diff against for `base`: the merge base with
/// `origin/<base>`, else with local `<base>`, else `<base>` itself.
async fn diff_target(
    session: &dyn SandboxSession,
    base: &str,
    cwd: Option<&str>,
) -> Result<String, GitError> {
    validate_branch_name(base)?;
    for candidate in [format!("origin/{base}"), base.to_string()] {
        let cmd = format!("git merge-base HEAD {}", shell_quote(&candidate));
        if let Ok(out) = git(session, cwd, &cmd).await {
            let sha = out.trim();
            if !sha.is_empty() {
                return Ok(sha.to_string());
            }
        }
    }
    Ok(base.to_string())
}

/// Working-tree changes relative to where the current branch forked from
/// `base`.
pub async fn git_diff_stats(
    session: &dyn SandboxSession,
    base: &str,
    cwd: Option<&str>,
) -> Result<GitDiffStats, GitError> {
    let target = diff_target(session, base, cwd).await?;
    let out = git(
        session,
        cwd,
        &format!("git diff --shortstat {}", shell_quote(&target)),
    )
    .await?;
    Ok(parse_git_shortstat(&out))
}

/// Full diff against `base` (or `HEAD` when `None`), refusing to return
/// more than `max_chars`.
pub async fn git_diff(
    session: &dyn SandboxSession,
    base: Option<&str>,
    max_chars: usize,
    cwd: Option<&str>,
) -> Result<DiffOutput, GitError> {
    let target = match base {
        Some(base) => diff_target(session, base, cwd).await?,
        None => "HEAD".to_string(),
    };
    let out = git(
        session,
        cwd,
        &format!("git diff --no-color {}", shell_quote(&target)),
    )
    .await?;

    if out.trim().is_empty() {
        return Ok(DiffOutput::Empty);
    }
    let chars = out.chars().count();
    if chars > max_chars {
        return Ok(DiffOutput::TooLarge { chars });
    }
    Ok(DiffOutput::Text(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{Reply, ScriptedSession};

    #[test]
    fn shortstat_plural_and_singular() {
        assert_eq!(
            parse_git_shortstat(" 2 files changed, 10 insertions(+), 3 deletions(-)\n"),
            GitDiffStats { files: 2, additions: 10, deletions: 3 }
        );
        assert_eq!(
            parse_git_shortstat("1 file changed, 1 insertion(+), 1 deletion(-)"),
            GitDiffStats { files: 1, additions: 1, deletions: 1 }
        );
    }

    #[test]
    fn shortstat_partial_forms() {
        assert_eq!(
            parse_git_shortstat("1 file changed, 4 deletions(-)"),
            GitDiffStats { files: 1, additions: 0, deletions: 4 }
        );
        assert_eq!(
            parse_git_shortstat("3 files changed, 7 insertions(+)"),
            GitDiffStats { files: 3, additions: 7, deletions: 0 }
        );
    }

    #[test]
    fn shortstat_pattern_is_compiled_once_and_reused() {
        assert!(SHORTSTAT.is_some());
        for n in 1..=3u64 {
            let text = format!("{n} files changed, {n} insertions(+)");
            assert_eq!(parse_git_shortstat(&text).additions, n);
        }
    }

    #[test]
    fn shortstat_empty_or_garbage_is_zero() {
        for text in ["", "   \n", "fatal: bad revision", "files changed"] {
            assert_eq!(parse_git_shortstat(text), GitDiffStats::default());
        }
    }

    #[tokio::test]
    async fn diff_stats_use_remote_merge_base() {
        let session = ScriptedSession::new();
        session
            .respond("merge-base HEAD 'origin/main'", Reply::ok("abc123\n"))
            .respond(
                "diff --shortstat 'abc123'",
                Reply::ok(" 1 file changed, 5 insertions(+)\n"),
            );
        let stats = git_diff_stats(&session, "main", None).await.unwrap();
        assert_eq!(stats, GitDiffStats { files: 1, additions: 5, deletions: 0 });
    }

    #[tokio::test]
    async fn diff_stats_fall_back_to_local_base() {
        let session = ScriptedSession::new();
        session
            .respond("merge-base HEAD 'origin/main'", Reply::fail(1, "", ""))
            .respond("merge-base HEAD 'main'", Reply::ok("def456\n"))
            .respond("diff --shortstat 'def456'", Reply::ok(""));
        let stats = git_diff_stats(&session, "main", None).await.unwrap();
        assert_eq!(stats, GitDiffStats::default());
    }

    #[tokio::test]
    async fn diff_stats_reject_unsafe_base() {
        let session = ScriptedSession::new();
        let err = git_diff_stats(&session, "main; rm -rf /", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::InvalidBranchName { .. }));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn diff_respects_cutoff() {
        let session = ScriptedSession::new();
        session.respond("git diff --no-color", Reply::ok("+line\n".repeat(100).as_str()));
        assert_eq!(
            git_diff(&session, None, 50, None).await.unwrap(),
            DiffOutput::TooLarge { chars: 600 }
        );
        assert!(matches!(
            git_diff(&session, None, 1000, None).await.unwrap(),
            DiffOutput::Text(_)
        ));

        let clean = ScriptedSession::new();
        assert_eq!(git_diff(&clean, None, 10, None).await.unwrap(), DiffOutput::Empty);
    }
}
