//! Git operations run through a [`SandboxSession`].
//!
//! Nothing here talks to git directly; every operation is a shell command
//! executed in the sandbox, with branch and ref arguments validated by
//! [`validate_branch_name`] and single-quoted before interpolation.

pub mod branch;
pub mod commit;
pub mod diff;
pub mod integrity;
pub mod push;

pub use crate::error::GitError;
pub use branch::{current_branch, fallback_branch_name, get_default_branch, validate_branch_name};
pub use commit::{
    git_commit_and_push_branch, CommitAndPushOptions, CommitAndPushOutcome,
    CommitMessageGenerator, GitIdentity, FALLBACK_COMMIT_MESSAGE,
};
pub use diff::{git_diff, git_diff_stats, parse_git_shortstat, DiffOutput, GitDiffStats};
pub use integrity::verify_git_integrity;
pub use push::{
    classify_push_failure, push_with_rebase, PushErrorKind, PushFailure, PushOptions, PushResult,
};

use crate::sandbox::{self, CommandOptions, SandboxSession};

/// Run `command` in `cwd` (the repo directory when `None`). Interactive
/// credential prompts are disabled so auth failures surface as errors.
pub(crate) async fn git(
    session: &dyn SandboxSession,
    cwd: Option<&str>,
    command: &str,
) -> sandbox::Result<String> {
    let mut options = CommandOptions::new().env("GIT_TERMINAL_PROMPT", "0");
    if let Some(cwd) = cwd {
        options = options.cwd(cwd);
    }
    session.run_command(command, options).await
}
