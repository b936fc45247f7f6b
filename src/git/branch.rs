//! Branch-name validation and default/current branch discovery.

use super::git;
use crate::error::GitError;
use crate::sandbox::SandboxSession;

/// Characters that must never reach a shell command line inside a ref.
const FORBIDDEN_CHARS: &[char] = &[
    ';', '|', '&', '$', '`', '"', '\'', '\\', '<', '>', '(', ')', '{', '}', '[', ']', '!', '*',
    '?', '~', '#',
];

/// Reject branch names that carry shell metacharacters, whitespace or
/// control characters.
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    if name.is_empty() {
        return Err(GitError::EmptyBranchName);
    }
    match name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || FORBIDDEN_CHARS.contains(c))
    {
        Some(offending) => Err(GitError::InvalidBranchName {
            name: name.to_string(),
            offending,
        }),
        None => Ok(()),
    }
}

/// Name used when neither the caller nor the branch-name hook supplies one.
pub fn fallback_branch_name() -> String {
    format!(
        "terragon/{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

pub async fn current_branch(
    session: &dyn SandboxSession,
    cwd: Option<&str>,
) -> Result<String, GitError> {
    let out = git(session, cwd, "git rev-parse --abbrev-ref HEAD").await?;
    Ok(out.trim().to_string())
}

/// Resolve the remote's default branch.
///
/// Shallow, single-branch and offline clones each keep a different subset
/// of this information, so several sources are tried in turn. Falls back to
/// `main`.
pub async fn get_default_branch(session: &dyn SandboxSession, cwd: Option<&str>) -> String {
    let probes: [(&str, fn(&str) -> Option<String>); 4] = [
        (
            "git symbolic-ref --short refs/remotes/origin/HEAD",
            parse_symbolic_ref,
        ),
        ("git ls-remote --symref origin HEAD", parse_ls_remote_symref),
        ("git config --get init.defaultBranch", parse_plain),
        ("git remote show origin", parse_remote_show),
    ];

    for (command, parse) in probes {
        match git(session, cwd, command).await {
            Ok(out) => {
                if let Some(branch) = parse(&out) {
                    tracing::debug!(branch = %branch, source = command, "Resolved default branch");
                    return branch;
                }
            }
            Err(e) => tracing::debug!(source = command, error = %e, "Default branch probe failed"),
        }
    }
    "main".to_string()
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_plain(out: &str) -> Option<String> {
    non_empty(out)
}

fn parse_symbolic_ref(out: &str) -> Option<String> {
    let out = out.trim();
    non_empty(out.strip_prefix("origin/").unwrap_or(out))
}

/// `ref: refs/heads/main\tHEAD`
fn parse_ls_remote_symref(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.strip_prefix("ref:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|r| r.strip_prefix("refs/heads/"))
        .find_map(non_empty)
}

/// `  HEAD branch: main`
fn parse_remote_show(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.trim().strip_prefix("HEAD branch:"))
        .map(str::trim)
        .find(|b| !b.is_empty() && *b != "(unknown)")
        .map(str::to_string)
}
