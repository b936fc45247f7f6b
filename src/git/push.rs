//! Push with fetch-and-rebase recovery.
//!
//! Every terminal branch yields a [`PushResult`]. Conflicts, rejections and
//! auth/network failures are expected outcomes a caller branches on, so
//! they are never raised as errors.

use super::branch::{current_branch, get_default_branch, validate_branch_name};
use super::git;
use crate::sandbox::{shell_quote, SandboxError, SandboxSession};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushErrorKind {
    Conflict,
    Rejected,
    Network,
    Auth,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did_update: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PushErrorKind>,
}

impl PushResult {
    fn pushed(did_update: bool, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            did_update: Some(did_update),
            error: None,
        }
    }

    fn failed(kind: PushErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            did_update: None,
            error: Some(kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Defaults to the currently checked-out branch.
    pub branch: Option<String>,
    pub set_upstream: bool,
    pub repo_root: Option<String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            branch: None,
            set_upstream: true,
            repo_root: None,
        }
    }
}

const NON_FAST_FORWARD_MARKERS: &[&str] = &["non-fast-forward", "fetch first", "Updates were rejected"];

const AUTH_MARKERS: &[&str] = &[
    "Authentication failed",
    "could not read Username",
    "could not read Password",
    "Invalid username or password",
    "Permission denied",
    "The requested URL returned error: 401",
    "The requested URL returned error: 403",
    "terminal prompts disabled",
];

const NETWORK_MARKERS: &[&str] = &[
    "Could not resolve host",
    "Connection refused",
    "Connection timed out",
    "Connection reset",
    "Network is unreachable",
    "Operation timed out",
    "Failed to connect",
    "unable to access",
    "Could not read from remote repository",
];

const CONFLICT_MARKERS: &[&str] = &["CONFLICT", "could not apply"];

/// How a failed push (or fetch) reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailure {
    /// `[rejected]` because the remote moved ahead; recoverable by rebase.
    NonFastForward,
    Auth,
    Network,
    Rejected,
    Unknown,
}

impl PushFailure {
    fn kind(self) -> PushErrorKind {
        match self {
            Self::NonFastForward | Self::Rejected => PushErrorKind::Rejected,
            Self::Auth => PushErrorKind::Auth,
            Self::Network => PushErrorKind::Network,
            Self::Unknown => PushErrorKind::Unknown,
        }
    }
}

fn contains_any(text: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| text.contains(m))
}

/// Classify combined git stdout/stderr.
pub fn classify_push_failure(output: &str) -> PushFailure {
    let rejected = output.contains("[rejected]");
    if rejected && contains_any(output, NON_FAST_FORWARD_MARKERS) {
        PushFailure::NonFastForward
    } else if contains_any(output, AUTH_MARKERS) {
        PushFailure::Auth
    } else if contains_any(output, NETWORK_MARKERS) {
        PushFailure::Network
    } else if rejected {
        PushFailure::Rejected
    } else {
        PushFailure::Unknown
    }
}

fn classify_error(err: &SandboxError) -> PushFailure {
    if err.is_timeout() {
        return PushFailure::Network;
    }
    classify_push_failure(&err.output_text())
}

/// Push `branch` to `origin`, recovering from a non-fast-forward rejection
/// by fetching and rebasing once.
pub async fn push_with_rebase(session: &dyn SandboxSession, options: &PushOptions) -> PushResult {
    let cwd = options.repo_root.as_deref();

    let branch = match &options.branch {
        Some(b) => b.clone(),
        None => match current_branch(session, cwd).await {
            Ok(b) => b,
            Err(e) => {
                return PushResult::failed(
                    PushErrorKind::Unknown,
                    format!("Failed to determine current branch: {e}"),
                )
            }
        },
    };

    if let Err(e) = validate_branch_name(&branch) {
        return PushResult::failed(PushErrorKind::Unknown, e.to_string());
    }

    let default_branch = get_default_branch(session, cwd).await;
    if branch == default_branch {
        return PushResult::failed(
            PushErrorKind::Rejected,
            format!("Cannot push to default branch {default_branch}"),
        );
    }

    let push_cmd = format!(
        "git push {}origin {}",
        if options.set_upstream { "-u " } else { "" },
        shell_quote(&branch)
    );

    let err = match git(session, cwd, &push_cmd).await {
        Ok(_) => {
            tracing::info!(sandbox_id = %session.sandbox_id(), branch = %branch, "Pushed branch");
            return PushResult::pushed(false, format!("Pushed {branch} to origin"));
        }
        Err(e) => e,
    };

    let failure = classify_error(&err);
    tracing::warn!(
        sandbox_id = %session.sandbox_id(),
        branch = %branch,
        ?failure,
        "Push failed"
    );
    if failure != PushFailure::NonFastForward {
        return PushResult::failed(failure.kind(), format!("Push failed: {}", err.output_text().trim()));
    }

    recover_with_rebase(session, cwd, &branch, &push_cmd).await
}

/// fetch → dirty check → rebase → single retry push, strictly in order.
async fn recover_with_rebase(
    session: &dyn SandboxSession,
    cwd: Option<&str>,
    branch: &str,
    push_cmd: &str,
) -> PushResult {
    if let Err(e) = git(session, cwd, "git fetch origin").await {
        let failure = classify_error(&e);
        let kind = match failure {
            PushFailure::Auth | PushFailure::Network => failure.kind(),
            _ => PushErrorKind::Unknown,
        };
        return PushResult::failed(kind, format!("Fetch failed: {}", e.output_text().trim()));
    }

    match git(session, cwd, "git status --porcelain").await {
        Ok(status) if !status.trim().is_empty() => {
            return PushResult::failed(
                PushErrorKind::Rejected,
                "Remote has new commits and the working tree has uncommitted changes; not rebasing",
            )
        }
        Ok(_) => {}
        Err(e) => {
            return PushResult::failed(
                PushErrorKind::Unknown,
                format!("Failed to inspect working tree: {e}"),
            )
        }
    }

    let upstream = shell_quote(&format!("origin/{branch}"));
    if let Err(e) = git(session, cwd, &format!("git rebase {upstream}")).await {
        let output = e.output_text();
        if let Err(abort_err) = git(session, cwd, "git rebase --abort").await {
            tracing::warn!(sandbox_id = %session.sandbox_id(), error = %abort_err, "git rebase --abort failed");
        }
        let kind = if contains_any(&output, CONFLICT_MARKERS) {
            PushErrorKind::Conflict
        } else {
            PushErrorKind::Unknown
        };
        tracing::warn!(sandbox_id = %session.sandbox_id(), branch, ?kind, "Rebase onto remote failed");
        return PushResult::failed(kind, format!("Rebase onto origin/{branch} failed: {}", output.trim()));
    }

    match git(session, cwd, push_cmd).await {
        Ok(_) => {
            tracing::info!(sandbox_id = %session.sandbox_id(), branch, "Pushed branch after rebase");
            PushResult::pushed(true, format!("Rebased onto origin/{branch} and pushed"))
        }
        Err(e) => PushResult::failed(
            classify_error(&e).kind(),
            format!("Push after rebase failed: {}", e.output_text().trim()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{Reply, ScriptedSession};

    const NFF: &str = " ! [rejected]        feature -> feature (fetch first)\nerror: failed to push some refs\nhint: Updates were rejected because the remote contains work";

    fn session_on(branch: &str) -> ScriptedSession {
        let session = ScriptedSession::new();
        session
            .respond("rev-parse --abbrev-ref HEAD", Reply::ok(&format!("{branch}\n")))
            .respond("symbolic-ref", Reply::ok("origin/main\n"));
        session
    }

    #[test]
    fn classification_markers() {
        assert_eq!(classify_push_failure(NFF), PushFailure::NonFastForward);
        assert_eq!(
            classify_push_failure("remote: Invalid username or password.\nfatal: Authentication failed"),
            PushFailure::Auth
        );
        assert_eq!(
            classify_push_failure("fatal: unable to access 'https://github.com/x/y.git/': Could not resolve host: github.com"),
            PushFailure::Network
        );
        assert_eq!(
            classify_push_failure(" ! [rejected] main -> main (protected branch hook declined)"),
            PushFailure::Rejected
        );
        assert_eq!(classify_push_failure("something odd"), PushFailure::Unknown);
    }

    #[tokio::test]
    async fn default_branch_is_rejected_without_pushing() {
        let session = session_on("main");
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(PushErrorKind::Rejected));
        assert!(!session.ran("git push"));
    }

    #[tokio::test]
    async fn invalid_branch_fails_before_any_git_command() {
        let session = ScriptedSession::new();
        let result = push_with_rebase(
            &session,
            &PushOptions {
                branch: Some("x; curl evil".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(result.error, Some(PushErrorKind::Unknown));
        assert!(session.commands().is_empty());
    }

    #[tokio::test]
    async fn plain_push_succeeds() {
        let session = session_on("feature/test");
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.did_update, Some(false));
        assert!(session.ran("git push -u origin 'feature/test'"));
    }

    #[tokio::test]
    async fn divergence_rebases_and_retries_once() {
        let session = session_on("feature/test");
        session.respond_once("git push", Reply::fail(1, "", NFF));
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.did_update, Some(true));
        assert_eq!(session.count("git push"), 2);

        let fetch = session.position("git fetch origin").unwrap();
        let status = session.position("git status --porcelain").unwrap();
        let rebase = session.position("git rebase 'origin/feature/test'").unwrap();
        assert!(fetch < status && status < rebase);
    }

    #[tokio::test]
    async fn conflicting_rebase_aborts_and_reports_conflict() {
        let session = session_on("feature/test");
        session
            .respond_once("git push", Reply::fail(1, "", NFF))
            .respond(
                "git rebase 'origin",
                Reply::fail(1, "CONFLICT (content): Merge conflict in a.txt", "error: could not apply 1234..."),
            );
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert_eq!(result.error, Some(PushErrorKind::Conflict));
        assert!(session.ran("git rebase --abort"));
        assert_eq!(session.count("git push"), 1);
    }

    #[tokio::test]
    async fn dirty_tree_refuses_rebase() {
        let session = session_on("feature/test");
        session
            .respond_once("git push", Reply::fail(1, "", NFF))
            .respond("git status --porcelain", Reply::ok(" M src/lib.rs\n"));
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert_eq!(result.error, Some(PushErrorKind::Rejected));
        assert!(!session.ran("git rebase"));
    }

    #[tokio::test]
    async fn second_rejection_is_not_retried_again() {
        let session = session_on("feature/test");
        session.respond("git push", Reply::fail(1, "", NFF));
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert_eq!(result.error, Some(PushErrorKind::Rejected));
        assert_eq!(session.count("git push"), 2);
        assert_eq!(session.count("git rebase 'origin"), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_classified() {
        let session = session_on("feature/test");
        session
            .respond_once("git push", Reply::fail(1, "", NFF))
            .respond("git fetch", Reply::fail(128, "", "fatal: Could not resolve host: github.com"));
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert_eq!(result.error, Some(PushErrorKind::Network));
    }

    #[tokio::test]
    async fn auth_failure_is_reported() {
        let session = session_on("feature/test");
        session.respond(
            "git push",
            Reply::fail(128, "", "fatal: could not read Username for 'https://github.com': terminal prompts disabled"),
        );
        let result = push_with_rebase(&session, &PushOptions::default()).await;
        assert_eq!(result.error, Some(PushErrorKind::Auth));
        assert!(!session.ran("git fetch"));
    }

    #[test]
    fn push_result_serialises_error_tag() {
        let json = serde_json::to_value(PushResult::failed(PushErrorKind::Conflict, "x")).unwrap();
        assert_eq!(json["error"], "CONFLICT");
        assert!(json.get("didUpdate").is_none());
    }
}
