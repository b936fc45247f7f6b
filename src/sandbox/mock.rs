//! Local/mock sandbox provider: runs commands as host processes.
//!
//! Each sandbox is a directory `<base_dir>/<sandbox_id>` with `home/` (also
//! exported as `HOME`, so global git config stays inside the sandbox),
//! `home/repo/` and `tmp/`. Hibernation is a marker file. Only constructable
//! outside production; see [`super::registry`].

use super::{
    join_path, BackgroundOptions, CommandOptions, OutputCallback, ProvisionRequest, Result,
    SandboxError, SandboxProvider, SandboxProviderKind, SandboxSession,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

const HIBERNATED_MARKER: &str = ".hibernated";

pub struct MockSandboxProvider {
    base_dir: PathBuf,
}

impl MockSandboxProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn root_for(&self, sandbox_id: &str) -> PathBuf {
        self.base_dir.join(sandbox_id)
    }

    pub(crate) fn session(&self, sandbox_id: &str) -> MockSandboxSession {
        MockSandboxSession {
            id: sandbox_id.to_string(),
            root: self.root_for(sandbox_id).to_string_lossy().into_owned(),
        }
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Mock
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<Arc<dyn SandboxSession>> {
        let id = format!("mock-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let session = self.session(&id);
        for dir in [session.home_path(), session.temp_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error(e, &format!("Failed to create {dir}")))?;
        }
        tracing::info!(sandbox_id = %id, size = ?request.size, root = %session.root, "Created mock sandbox");
        Ok(Arc::new(session))
    }

    async fn resume(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let root = self.root_for(sandbox_id);
        if !root.is_dir() {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        let marker = root.join(HIBERNATED_MARKER);
        if marker.exists() {
            tokio::fs::remove_file(&marker)
                .await
                .map_err(|e| io_error(e, "Failed to clear hibernation marker"))?;
        }
        tracing::info!(sandbox_id, "Resumed mock sandbox");
        Ok(Arc::new(self.session(sandbox_id)))
    }

    async fn hibernate_by_id(&self, sandbox_id: &str) -> Result<()> {
        self.session(sandbox_id).hibernate().await
    }

    async fn extend_life(&self, sandbox_id: &str) -> Result<()> {
        if !self.root_for(sandbox_id).is_dir() {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockSandboxSession {
    id: String,
    root: String,
}

impl MockSandboxSession {
    fn command(&self, command: &str, env: &std::collections::BTreeMap<String, String>, cwd: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env("HOME", self.home_path())
            .envs(env.iter());
        cmd
    }

    fn cwd_for(&self, cwd: Option<&str>) -> String {
        cwd.map(|c| self.resolve_path(c))
            .unwrap_or_else(|| self.repo_path())
    }
}

#[async_trait]
impl SandboxSession for MockSandboxSession {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn sandbox_provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Mock
    }

    fn root_dir(&self) -> &str {
        &self.root
    }

    fn home_dir(&self) -> &str {
        "home"
    }

    fn repo_dir(&self) -> &str {
        "repo"
    }

    fn temp_dir(&self) -> String {
        join_path(&self.root, "tmp")
    }

    async fn run_command(&self, command: &str, options: CommandOptions) -> Result<String> {
        let cwd = self.cwd_for(options.cwd.as_deref());
        let timeout = options.effective_timeout();

        let mut child = self
            .command(command, &options.env, &cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_error(e, &format!("Failed to spawn command in {cwd}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let on_stdout = options.on_stdout.clone();
        let on_stderr = options.on_stderr.clone();

        let run = async move {
            let (out, err, status) = tokio::join!(
                read_stream(stdout, on_stdout),
                read_stream(stderr, on_stderr),
                child.wait()
            );
            Ok::<_, std::io::Error>((out?, err?, status?))
        };

        let (stdout, stderr, status) = match tokio::time::timeout(timeout, run).await {
            Err(_elapsed) => {
                return Err(SandboxError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => return Err(io_error(e, "Failed to collect command output")),
            Ok(Ok(result)) => result,
        };

        if status.success() {
            Ok(stdout)
        } else {
            Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code: status.code().map(i64::from).unwrap_or(-1),
                stdout,
                stderr,
            })
        }
    }

    async fn run_background_command(
        &self,
        command: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        let cwd = self.cwd_for(options.cwd.as_deref());
        let mut cmd = self.command(command, &options.env, &cwd);
        cmd.stdin(Stdio::null());

        let Some(on_output) = options.on_output.clone() else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            cmd.spawn()
                .map_err(|e| io_error(e, "Failed to spawn background command"))?;
            return Ok(());
        };

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| io_error(e, "Failed to spawn background command"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let timeout = options.effective_timeout();
        let sandbox_id = self.id.clone();

        tokio::spawn(async move {
            let follow = async {
                let _ = tokio::join!(
                    read_stream(stdout, Some(on_output.clone())),
                    read_stream(stderr, Some(on_output.clone())),
                );
                child.wait().await
            };
            match tokio::time::timeout(timeout, follow).await {
                Ok(Ok(status)) => {
                    tracing::debug!(sandbox_id = %sandbox_id, code = ?status.code(), "Background command exited")
                }
                Ok(Err(e)) => tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Background command wait failed"),
                Err(_) => tracing::warn!(
                    sandbox_id = %sandbox_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background command timed out; leaving process running"
                ),
            }
        });

        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| io_error(e, &format!("Failed to read {resolved}")))
    }

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()> {
        self.write_file(path, contents.as_bytes()).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let resolved = self.resolve_path(path);
        if let Some(parent) = Path::new(&resolved).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, &format!("Failed to create {}", parent.display())))?;
        }
        tokio::fs::write(&resolved, contents)
            .await
            .map_err(|e| io_error(e, &format!("Failed to write {resolved}")))
    }

    async fn hibernate(&self) -> Result<()> {
        let root = Path::new(&self.root);
        if !root.is_dir() {
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        tokio::fs::write(root.join(HIBERNATED_MARKER), b"")
            .await
            .map_err(|e| io_error(e, "Failed to write hibernation marker"))?;
        tracing::info!(sandbox_id = %self.id, "Hibernated mock sandbox");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, "Failed to remove sandbox root")),
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(
    reader: Option<R>,
    callback: Option<OutputCallback>,
) -> std::io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut collected = Vec::new();
    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(cb) = &callback {
            pending.extend_from_slice(&buf[..n]);
            let (text, used) = decode_complete(&pending);
            pending.drain(..used);
            if !text.is_empty() {
                cb(&text);
            }
        }
    }
    if let Some(cb) = &callback {
        if !pending.is_empty() {
            cb(&String::from_utf8_lossy(&pending));
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// Decode `bytes` up to a trailing incomplete UTF-8 sequence, which is left
/// for the next read. Returns the text and the number of bytes consumed.
fn decode_complete(bytes: &[u8]) -> (String, usize) {
    let mut text = String::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match std::str::from_utf8(&bytes[pos..]) {
            Ok(rest) => {
                text.push_str(rest);
                pos = bytes.len();
            }
            Err(e) => {
                let valid = pos + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&bytes[pos..valid]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pos = valid + bad;
                    }
                    None => return (text, valid),
                }
            }
        }
    }
    (text, pos)
}

fn io_error(e: std::io::Error, context: &str) -> SandboxError {
    SandboxError::Transport(anyhow::Error::new(e).context(context.to_string()))
}
