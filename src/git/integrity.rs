//! Object-store verification for blobless clones.

use super::git;
use crate::error::{GitError, SandboxError};
use crate::sandbox::SandboxSession;

/// Run `git fsck` after `operation`. On corruption, optionally unstage with
/// `git reset` (best-effort) and fail with
/// [`GitError::IntegrityCheckFailed`].
pub async fn verify_git_integrity(
    session: &dyn SandboxSession,
    operation: &str,
    reset_on_failure: bool,
    cwd: Option<&str>,
) -> Result<(), GitError> {
    let err = match git(session, cwd, "git fsck --no-dangling --no-progress").await {
        Ok(_) => return Ok(()),
        Err(e @ SandboxError::NonZeroExit { .. }) => e,
        Err(e) => return Err(e.into()),
    };

    let details = err.output_text().trim().to_string();
    tracing::error!(
        sandbox_id = %session.sandbox_id(),
        operation,
        details = %details,
        "Git integrity check failed"
    );

    if reset_on_failure {
        if let Err(e) = git(session, cwd, "git reset").await {
            tracing::warn!(sandbox_id = %session.sandbox_id(), error = %e, "git reset after failed integrity check also failed");
        }
    }

    Err(GitError::IntegrityCheckFailed {
        operation: operation.to_string(),
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{Reply, ScriptedSession};

    #[tokio::test]
    async fn clean_repository_passes() {
        let session = ScriptedSession::new();
        verify_git_integrity(&session, "git add -A", true, None)
            .await
            .unwrap();
        assert!(!session.ran("git reset"));
    }

    #[tokio::test]
    async fn corruption_resets_and_fails() {
        let session = ScriptedSession::new();
        session
            .respond("git fsck", Reply::fail(2, "", "error: missing blob 1234abcd"))
            .respond("git reset", Reply::fail(1, "", "reset also broken"));
        let err = verify_git_integrity(&session, "git add -N .", true, None)
            .await
            .unwrap_err();
        assert!(session.ran("git reset"));
        let msg = err.to_string();
        assert!(msg.contains("after git add -N ."));
        assert!(msg.contains("missing blob"));
    }

    #[tokio::test]
    async fn corruption_without_reset() {
        let session = ScriptedSession::new();
        session.respond("git fsck", Reply::fail(2, "", "broken link"));
        let err = verify_git_integrity(&session, "pre-push", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::IntegrityCheckFailed { .. }));
        assert!(!session.ran("git reset"));
    }

    #[tokio::test]
    async fn timeout_propagates_as_sandbox_error() {
        let session = ScriptedSession::new();
        session.respond("git fsck", Reply::Timeout);
        let err = verify_git_integrity(&session, "pre-push", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::Sandbox(SandboxError::Timeout { .. })));
    }
}
