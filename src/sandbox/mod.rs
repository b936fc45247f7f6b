//! Sandbox abstraction layer.
//!
//! Defines the [`SandboxSession`] contract for one running sandbox and the
//! [`SandboxProvider`] contract for creating, resuming and suspending them.
//! Four backends implement both:
//!
//! - [`docker::DockerSandboxProvider`]: container via the Docker Engine API
//! - [`e2b::E2bSandboxProvider`]: cloud micro-VM via the E2B REST API
//! - [`daytona::DaytonaSandboxProvider`]: cloud workspace with session-based exec
//! - [`mock::MockSandboxProvider`]: local processes in a scratch directory (dev/test only)
//!
//! [`registry::ProviderRegistry`] picks one by [`SandboxProviderKind`].

pub mod background;
pub mod daytona;
pub mod docker;
pub mod e2b;
pub mod mock;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use crate::error::SandboxError;
pub use registry::ProviderRegistry;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Receives output chunks as they arrive.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Timeout applied to [`SandboxSession::run_command`] when none is given.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Timeout applied to [`SandboxSession::run_background_command`] when none is given.
pub const DEFAULT_BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Which backend a sandbox lives on. The serialized names are persisted by
/// callers alongside the sandbox id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxProviderKind {
    /// Container-backed (Docker).
    #[serde(rename = "docker")]
    Container,
    /// Micro-VM-backed (E2B).
    #[serde(rename = "e2b")]
    MicroVm,
    /// Workspace-backed (Daytona).
    #[serde(rename = "daytona")]
    Workspace,
    /// Local processes; never available in production.
    #[serde(rename = "mock")]
    Mock,
}

impl SandboxProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "docker",
            Self::MicroVm => "e2b",
            Self::Workspace => "daytona",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for SandboxProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Ok(Self::Container),
            "e2b" | "microvm" => Ok(Self::MicroVm),
            "daytona" | "workspace" => Ok(Self::Workspace),
            "mock" | "local" => Ok(Self::Mock),
            other => anyhow::bail!("unknown sandbox provider: {other}"),
        }
    }
}

/// Requested compute class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxSize {
    #[default]
    Small,
    Large,
}

impl SandboxSize {
    pub fn cpu_count(&self) -> u32 {
        match self {
            Self::Small => 2,
            Self::Large => 4,
        }
    }

    pub fn memory_mb(&self) -> u64 {
        match self {
            Self::Small => 4 * 1024,
            Self::Large => 8 * 1024,
        }
    }
}

/// Provider-facing part of a create request.
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub size: SandboxSize,
    /// Free-form labels/metadata attached to the sandbox at the provider.
    pub labels: BTreeMap<String, String>,
}

/// Options for a blocking command.
#[derive(Clone, Default)]
pub struct CommandOptions {
    pub env: BTreeMap<String, String>,
    /// Working directory; relative paths resolve against the repo directory.
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn on_stdout(mut self, callback: OutputCallback) -> Self {
        self.on_stdout = Some(callback);
        self
    }

    pub fn on_stderr(mut self, callback: OutputCallback) -> Self {
        self.on_stderr = Some(callback);
        self
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Options for a detached command.
#[derive(Clone, Default)]
pub struct BackgroundOptions {
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
    /// Merged stdout/stderr chunks, delivered until exit or timeout.
    pub on_output: Option<OutputCallback>,
}

impl BackgroundOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_output(mut self, callback: OutputCallback) -> Self {
        self.on_output = Some(callback);
        self
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_BACKGROUND_TIMEOUT)
    }
}

impl fmt::Debug for BackgroundOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundOptions")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

/// One running sandbox.
///
/// Commands and relative file paths are resolved against [`repo_path`]
/// unless an explicit `cwd` is given. Concurrent calls are allowed; callers
/// sequence anything that mutates the same working tree.
///
/// [`repo_path`]: SandboxSession::repo_path
#[async_trait]
pub trait SandboxSession: Send + Sync {
    fn sandbox_id(&self) -> &str;

    fn sandbox_provider(&self) -> SandboxProviderKind;

    /// Absolute root every other directory hangs off.
    fn root_dir(&self) -> &str;

    /// Home directory, relative to [`root_dir`](SandboxSession::root_dir).
    fn home_dir(&self) -> &str;

    /// Repository checkout, relative to the home directory.
    fn repo_dir(&self) -> &str;

    /// Scratch directory for daemon files and temp files.
    fn temp_dir(&self) -> String {
        "/tmp".to_string()
    }

    /// Run a command to completion and return its stdout.
    ///
    /// Fails with [`SandboxError::Timeout`] or [`SandboxError::NonZeroExit`];
    /// transport failures come back as [`SandboxError::Transport`].
    async fn run_command(&self, command: &str, options: CommandOptions) -> Result<String>;

    /// Dispatch a command and return immediately. Output, if requested, is
    /// delivered through `on_output` until the process exits or the timeout
    /// elapses; the process itself may outlive the timeout.
    async fn run_background_command(&self, command: &str, options: BackgroundOptions)
        -> Result<()>;

    async fn read_text_file(&self, path: &str) -> Result<String>;

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Suspend the sandbox. A later resume yields a new session value.
    async fn hibernate(&self) -> Result<()>;

    /// Destroy the sandbox.
    async fn shutdown(&self) -> Result<()>;

    fn home_path(&self) -> String {
        join_path(self.root_dir(), self.home_dir())
    }

    fn repo_path(&self) -> String {
        join_path(&self.home_path(), self.repo_dir())
    }

    /// Resolve `path` against the repo directory unless already absolute.
    fn resolve_path(&self, path: &str) -> String {
        join_path(&self.repo_path(), path)
    }
}

/// Creates, resumes and suspends sandboxes on one backend.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> SandboxProviderKind;

    /// Resume `existing_id` if given, otherwise create a fresh sandbox.
    async fn get_or_create_sandbox(
        &self,
        existing_id: Option<&str>,
        request: &ProvisionRequest,
    ) -> Result<Arc<dyn SandboxSession>> {
        match existing_id {
            Some(id) => self.resume(id).await,
            None => self.create(request).await,
        }
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<Arc<dyn SandboxSession>>;

    /// Fails with [`SandboxError::NotFound`] if the id is unknown.
    async fn resume(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>>;

    async fn hibernate_by_id(&self, sandbox_id: &str) -> Result<()>;

    /// Push back the provider's idle/auto-stop deadline.
    async fn extend_life(&self, sandbox_id: &str) -> Result<()>;
}

/// Join `child` onto `base` unless `child` is already absolute.
pub fn join_path(base: &str, child: &str) -> String {
    if child.starts_with('/') {
        return child.to_string();
    }
    let child = child.trim_start_matches("./");
    if child.is_empty() || child == "." {
        return base.to_string();
    }
    if base.is_empty() {
        return child.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child)
}

/// Parent directory of an absolute path, `/` at the top.
pub fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Single-quote `value` for POSIX shells, escaping embedded quotes with the
/// `'"'"'` idiom.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Turn an arbitrary string into a valid shell variable name.
pub fn env_key(key: &str) -> String {
    let mut out: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// `export KEY='value'`
pub fn export_line(key: &str, value: &str) -> String {
    format!("export {}={}", env_key(key), shell_quote(value))
}

/// Prefix `command` with a `cd` and env exports so it can be dispatched
/// through a plain `sh -c`.
pub fn with_env_and_cwd(command: &str, env: &BTreeMap<String, String>, cwd: &str) -> String {
    let mut parts = vec![format!("cd {}", shell_quote(cwd))];
    parts.extend(env.iter().map(|(k, v)| export_line(k, v)));
    parts.push(command.to_string());
    parts.join(" && ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn env_key_sanitizes() {
        assert_eq!(env_key("GH_TOKEN"), "GH_TOKEN");
        assert_eq!(env_key("my-var.name"), "my_var_name");
        assert_eq!(env_key("1PASSWORD"), "_1PASSWORD");
        assert_eq!(env_key(""), "_");
    }

    #[test]
    fn export_line_combines_key_and_quoting() {
        assert_eq!(export_line("a-b", "x'y"), r#"export a_b='x'"'"'y'"#);
    }

    #[test]
    fn join_path_respects_absolute_children() {
        assert_eq!(join_path("/home/user", "repo"), "/home/user/repo");
        assert_eq!(join_path("/home/user/", "./repo"), "/home/user/repo");
        assert_eq!(join_path("/home/user", "/tmp/x"), "/tmp/x");
        assert_eq!(join_path("/home/user", "."), "/home/user");
    }

    #[test]
    fn parent_dir_walks_up() {
        assert_eq!(parent_dir("/tmp/a/b.txt"), "/tmp/a");
        assert_eq!(parent_dir("/b.txt"), "/");
        assert_eq!(parent_dir("relative"), "/");
    }

    #[test]
    fn with_env_and_cwd_builds_chain() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar baz".to_string());
        assert_eq!(
            with_env_and_cwd("make test", &env, "/home/user/repo"),
            "cd '/home/user/repo' && export FOO='bar baz' && make test"
        );
    }

    #[test]
    fn provider_kind_round_trips_through_names() {
        for kind in [
            SandboxProviderKind::Container,
            SandboxProviderKind::MicroVm,
            SandboxProviderKind::Workspace,
            SandboxProviderKind::Mock,
        ] {
            assert_eq!(kind.as_str().parse::<SandboxProviderKind>().unwrap(), kind);
        }
        assert_eq!(
            serde_json::to_string(&SandboxProviderKind::MicroVm).unwrap(),
            "\"e2b\""
        );
    }
}
