//! Commit everything in the working tree and push it.

use super::branch::{current_branch, get_default_branch, validate_branch_name};
use super::integrity::verify_git_integrity;
use super::push::{push_with_rebase, PushOptions, PushResult};
use super::git;
use crate::error::GitError;
use crate::sandbox::{join_path, shell_quote, SandboxSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const FALLBACK_COMMIT_MESSAGE: &str = "Update code";

/// Diff characters handed to the commit-message generator.
const DIFF_CUTOFF_CHARS: usize = 50_000;

/// Produces a commit message from a (possibly truncated) diff.
#[async_trait]
pub trait CommitMessageGenerator: Send + Sync {
    async fn generate(&self, diff: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    fn trailer(&self) -> String {
        format!("Co-authored-by: {} <{}>", self.name, self.email)
    }
}

#[derive(Clone, Default)]
pub struct CommitAndPushOptions {
    /// Branch the work started from; used to decide whether an
    /// unpublished branch has anything to push. Defaults to the remote's
    /// default branch.
    pub base_branch: Option<String>,
    pub co_author: Option<GitIdentity>,
    pub generator: Option<Arc<dyn CommitMessageGenerator>>,
    pub repo_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAndPushOutcome {
    pub branch_name: String,
    /// Whether a new commit was created.
    pub committed: bool,
    /// `None` when there was nothing to push.
    pub push: Option<PushResult>,
}

/// Commit all changes on the current branch and push them with
/// [`push_with_rebase`]. With a clean tree that is already in sync, runs no
/// mutating git command at all.
pub async fn git_commit_and_push_branch(
    session: &dyn SandboxSession,
    options: &CommitAndPushOptions,
) -> Result<CommitAndPushOutcome, GitError> {
    let cwd = options.repo_root.as_deref();
    let branch = current_branch(session, cwd).await?;
    validate_branch_name(&branch)?;

    let status = git(session, cwd, "git status --porcelain").await?;
    let changed = status.lines().filter(|l| !l.trim().is_empty()).count();

    if changed == 0 {
        if !needs_push(session, cwd, &branch, options.base_branch.as_deref()).await {
            tracing::debug!(sandbox_id = %session.sandbox_id(), branch = %branch, "Nothing to commit or push");
            return Ok(CommitAndPushOutcome {
                branch_name: branch,
                committed: false,
                push: None,
            });
        }
        verify_git_integrity(session, "pre-push", false, cwd).await?;
        let push = push_with_rebase(session, &push_options(&branch, cwd)).await;
        return Ok(CommitAndPushOutcome {
            branch_name: branch,
            committed: false,
            push: Some(push),
        });
    }

    tracing::info!(sandbox_id = %session.sandbox_id(), branch = %branch, changed, "Committing changes");

    let mut temp_files = Vec::new();
    let result = commit_all(session, cwd, options, &mut temp_files).await;
    remove_temp_files(session, &temp_files).await;
    result?;

    verify_git_integrity(session, "pre-push", false, cwd).await?;
    let push = push_with_rebase(session, &push_options(&branch, cwd)).await;
    Ok(CommitAndPushOutcome {
        branch_name: branch,
        committed: true,
        push: Some(push),
    })
}

fn push_options(branch: &str, cwd: Option<&str>) -> PushOptions {
    PushOptions {
        branch: Some(branch.to_string()),
        repo_root: cwd.map(str::to_string),
        ..Default::default()
    }
}

async fn commit_all(
    session: &dyn SandboxSession,
    cwd: Option<&str>,
    options: &CommitAndPushOptions,
    temp_files: &mut Vec<String>,
) -> Result<(), GitError> {
    git(session, cwd, "git add -N .").await?;
    verify_git_integrity(session, "git add -N .", true, cwd).await?;

    let patch_path = temp_path(session, "patch", "diff");
    temp_files.push(patch_path.clone());
    let diff = match git(
        session,
        cwd,
        &format!(
            "git diff HEAD --no-color > {patch} && head -c {DIFF_CUTOFF_CHARS} {patch}",
            patch = shell_quote(&patch_path)
        ),
    )
    .await
    {
        Ok(diff) => diff,
        Err(e) => {
            tracing::warn!(sandbox_id = %session.sandbox_id(), error = %e, "Failed to capture diff for commit message");
            String::new()
        }
    };

    let mut message = generate_message(options.generator.as_deref(), &diff).await;
    if let Some(co_author) = &options.co_author {
        message = format!("{message}\n\n{}", co_author.trailer());
    }

    git(session, cwd, "git add -A").await?;
    verify_git_integrity(session, "git add -A", true, cwd).await?;

    let message_path = temp_path(session, "commit-msg", "txt");
    temp_files.push(message_path.clone());
    session.write_text_file(&message_path, &message).await?;

    let commit = format!(
        "git commit -F {} 2>&1 | head -n 50",
        shell_quote(&message_path)
    );
    if let Err(e) = git(session, cwd, &format!("bash -o pipefail -c {}", shell_quote(&commit))).await {
        return Err(GitError::CommitFailed(e.output_text().trim().to_string()));
    }
    Ok(())
}

async fn generate_message(generator: Option<&dyn CommitMessageGenerator>, diff: &str) -> String {
    let Some(generator) = generator else {
        return FALLBACK_COMMIT_MESSAGE.to_string();
    };
    match generator.generate(diff).await {
        Ok(message) if !message.trim().is_empty() => message.trim().to_string(),
        Ok(_) => FALLBACK_COMMIT_MESSAGE.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Commit message generation failed, using fallback");
            FALLBACK_COMMIT_MESSAGE.to_string()
        }
    }
}

/// Whether a clean branch still has commits its remote lacks.
async fn needs_push(
    session: &dyn SandboxSession,
    cwd: Option<&str>,
    branch: &str,
    base_branch: Option<&str>,
) -> bool {
    let tracking = format!("refs/remotes/origin/{branch}");
    let has_remote = git(
        session,
        cwd,
        &format!("git rev-parse --verify --quiet {}", shell_quote(&tracking)),
    )
    .await
    .is_ok();

    let compare_to = if has_remote {
        format!("origin/{branch}")
    } else {
        let base = match base_branch {
            Some(b) => b.to_string(),
            None => get_default_branch(session, cwd).await,
        };
        if validate_branch_name(&base).is_err() {
            return true;
        }
        format!("origin/{base}")
    };

    let range = shell_quote(&format!("{compare_to}..HEAD"));
    match git(session, cwd, &format!("git rev-list --count {range}")).await {
        Ok(out) => out.trim().parse::<u64>().map(|n| n > 0).unwrap_or(true),
        Err(e) => {
            tracing::debug!(error = %e, compare_to = %compare_to, "Could not count unpushed commits");
            true
        }
    }
}

fn temp_path(session: &dyn SandboxSession, stem: &str, ext: &str) -> String {
    join_path(
        &session.temp_dir(),
        &format!(
            "terragon-{stem}-{}.{ext}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        ),
    )
}

async fn remove_temp_files(session: &dyn SandboxSession, paths: &[String]) {
    if paths.is_empty() {
        return;
    }
    let args = paths
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    if let Err(e) = git(session, None, &format!("rm -f {args}")).await {
        tracing::warn!(sandbox_id = %session.sandbox_id(), error = %e, "Failed to remove temp files");
    }
}
