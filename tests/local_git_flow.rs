//! Full create → edit → commit-and-push flow through the mock provider
//! against a local bare remote. Skipped when `git` is not installed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use terragon_sandbox::config::Environment;
use terragon_sandbox::git::{git_commit_and_push_branch, git_diff_stats, PushErrorKind};
use terragon_sandbox::{
    CreateSandboxOptions, DaemonAssets, Orchestrator, SandboxConfig, SandboxProviderKind,
    SandboxSession,
};
use tempfile::TempDir;

fn git_available() -> bool {
    which::which("git").is_ok() && which::which("bash").is_ok()
}

fn host_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Host")
        .env("GIT_AUTHOR_EMAIL", "host@example.com")
        .env("GIT_COMMITTER_NAME", "Host")
        .env("GIT_COMMITTER_EMAIL", "host@example.com")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A bare remote whose `main` holds a single README commit.
fn seed_remote(tmp: &TempDir) -> PathBuf {
    let seed = tmp.path().join("seed");
    std::fs::create_dir_all(&seed).unwrap();
    host_git(&seed, &["init", "-q", "-b", "main"]);
    std::fs::write(seed.join("README.md"), "# demo\n").unwrap();
    host_git(&seed, &["add", "README.md"]);
    host_git(&seed, &["commit", "-q", "-m", "Initial commit"]);

    let remote = tmp.path().join("remote.git");
    host_git(
        tmp.path(),
        &["clone", "-q", "--bare", seed.to_str().unwrap(), remote.to_str().unwrap()],
    );
    remote
}

fn orchestrator(tmp: &TempDir) -> Orchestrator {
    let mut config = SandboxConfig::default();
    config.environment = Environment::Test;
    config.retry.delay_ms = 0;
    config.mock.base_dir = tmp.path().join("sandboxes").to_string_lossy().into_owned();
    config.daemon.node_binary = "true".into();
    Orchestrator::new(
        config,
        DaemonAssets {
            daemon_script: "// daemon\n".into(),
            mcp_server_script: "// mcp\n".into(),
        },
    )
}

fn options(remote: &Path) -> CreateSandboxOptions {
    let mut options = CreateSandboxOptions::new("terragon-labs/demo");
    options.clone_url = Some(remote.to_string_lossy().into_owned());
    options.base_branch = Some("main".into());
    options.branch_name = Some("feature/test".into());
    options.install_agent = false;
    options
}

async fn boot(tmp: &TempDir, remote: &Path) -> (Orchestrator, CreateSandboxOptions, Arc<dyn SandboxSession>) {
    let orchestrator = orchestrator(tmp);
    let options = options(remote);
    let session = orchestrator
        .get_or_create_sandbox(SandboxProviderKind::Mock, &options)
        .await
        .unwrap();
    (orchestrator, options, session)
}

#[tokio::test]
async fn commit_push_and_diff_stats() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let remote = seed_remote(&tmp);
    let (orchestrator, options, session) = boot(&tmp, &remote).await;

    session
        .write_text_file("hello.txt", "hello from the sandbox\n")
        .await
        .unwrap();

    let outcome = orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap();
    assert_eq!(outcome.branch_name, "feature/test");
    assert!(outcome.committed);
    let push = outcome.push.unwrap();
    assert!(push.success, "{}", push.message);

    let files = host_git(
        &remote,
        &["log", "-1", "--name-only", "--format=", "feature/test"],
    );
    assert_eq!(files.trim(), "hello.txt");
    let main_log = host_git(&remote, &["log", "--oneline", "main"]);
    assert_eq!(main_log.lines().count(), 1);

    let again = git_commit_and_push_branch(session.as_ref(), &options.commit_and_push_options())
        .await
        .unwrap();
    assert_eq!(again.branch_name, "feature/test");
    assert!(!again.committed);
    assert!(again.push.is_none());

    let stats = git_diff_stats(session.as_ref(), "main", None).await.unwrap();
    assert_eq!(stats.files, 1);
    assert!(stats.additions > 0);
    assert_eq!(stats.deletions, 0);

    let env_file = session
        .read_text_file(&format!("{}/.terragon/env.sh", session.home_path()))
        .await
        .unwrap();
    assert!(env_file.starts_with('#'));
}

/// Someone else pushed to the work branch in between; the sandbox rebases
/// onto their commit and pushes again.
#[tokio::test]
async fn diverged_branch_is_rebased_then_pushed() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let remote = seed_remote(&tmp);
    let (orchestrator, options, session) = boot(&tmp, &remote).await;

    session.write_text_file("a.txt", "a\n").await.unwrap();
    assert!(orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap()
        .push
        .unwrap()
        .success);

    let other = tmp.path().join("other");
    host_git(
        tmp.path(),
        &["clone", "-q", "-b", "feature/test", remote.to_str().unwrap(), other.to_str().unwrap()],
    );
    std::fs::write(other.join("b.txt"), "b\n").unwrap();
    host_git(&other, &["add", "b.txt"]);
    host_git(&other, &["commit", "-q", "-m", "Concurrent change"]);
    host_git(&other, &["push", "-q", "origin", "feature/test"]);

    session.write_text_file("c.txt", "c\n").await.unwrap();
    let push = orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap()
        .push
        .unwrap();
    assert!(push.success, "{}", push.message);
    assert_eq!(push.did_update, Some(true));

    let log = host_git(&remote, &["log", "--format=%s", "feature/test"]);
    assert!(log.contains("Concurrent change"));
    assert_eq!(log.lines().count(), 4);
}

#[tokio::test]
async fn conflicting_edit_reports_conflict_and_aborts_rebase() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let remote = seed_remote(&tmp);
    let (orchestrator, options, session) = boot(&tmp, &remote).await;

    session.write_text_file("shared.txt", "base\n").await.unwrap();
    orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap();

    let other = tmp.path().join("other");
    host_git(
        tmp.path(),
        &["clone", "-q", "-b", "feature/test", remote.to_str().unwrap(), other.to_str().unwrap()],
    );
    std::fs::write(other.join("shared.txt"), "theirs\n").unwrap();
    host_git(&other, &["commit", "-q", "-am", "Their edit"]);
    host_git(&other, &["push", "-q", "origin", "feature/test"]);

    session.write_text_file("shared.txt", "ours\n").await.unwrap();
    let push = orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap()
        .push
        .unwrap();
    assert!(!push.success);
    assert_eq!(push.error, Some(PushErrorKind::Conflict));

    let rebasing = session
        .run_command(
            "test -d .git/rebase-merge || test -d .git/rebase-apply",
            Default::default(),
        )
        .await;
    assert!(rebasing.is_err(), "rebase was left in progress");
}

#[tokio::test]
async fn pushing_the_default_branch_is_rejected() {
    if !git_available() {
        eprintln!("git not found, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let remote = seed_remote(&tmp);
    let orchestrator = orchestrator(&tmp);
    let mut options = options(&remote);
    options.branch_name = None;
    options.create_new_branch = false;
    let session = orchestrator
        .get_or_create_sandbox(SandboxProviderKind::Mock, &options)
        .await
        .unwrap();

    session.write_text_file("x.txt", "x\n").await.unwrap();
    let outcome = orchestrator
        .commit_and_push(session.as_ref(), &options)
        .await
        .unwrap();
    assert_eq!(outcome.branch_name, "main");
    let push = outcome.push.unwrap();
    assert_eq!(push.error, Some(PushErrorKind::Rejected));

    let main_log = host_git(&remote, &["log", "--oneline", "main"]);
    assert_eq!(main_log.lines().count(), 1);
}
