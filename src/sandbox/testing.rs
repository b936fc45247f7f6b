//! Scripted in-memory session for unit tests.
//!
//! Commands are matched by substring against registered replies: one-shot
//! replies first (in registration order), then persistent ones. Unmatched
//! commands succeed with empty stdout. Files live in a map keyed by resolved
//! path.

use super::{
    BackgroundOptions, CommandOptions, Result, SandboxError, SandboxProviderKind, SandboxSession,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(String),
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
    },
    Timeout,
}

impl Reply {
    pub(crate) fn ok(stdout: &str) -> Self {
        Self::Ok(stdout.to_string())
    }

    pub(crate) fn fail(code: i64, stdout: &str, stderr: &str) -> Self {
        Self::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ScriptedSession {
    once: Mutex<Vec<(String, Reply)>>,
    always: Mutex<Vec<(String, Reply)>>,
    commands: Mutex<Vec<String>>,
    background: Mutex<Vec<(String, BackgroundOptions)>>,
    files: Mutex<HashMap<String, String>>,
    hibernated: Mutex<bool>,
}

impl ScriptedSession {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, pattern: &str, reply: Reply) -> &Self {
        self.always.lock().push((pattern.to_string(), reply));
        self
    }

    pub(crate) fn respond_once(&self, pattern: &str, reply: Reply) -> &Self {
        self.once.lock().push((pattern.to_string(), reply));
        self
    }

    pub(crate) fn put_file(&self, path: &str, contents: &str) {
        let resolved = self.resolve_path(path);
        self.files.lock().insert(resolved, contents.to_string());
    }

    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(&self.resolve_path(path)).cloned()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub(crate) fn ran(&self, pattern: &str) -> bool {
        self.commands.lock().iter().any(|c| c.contains(pattern))
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Index of the first command containing `pattern`.
    pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
        self.commands.lock().iter().position(|c| c.contains(pattern))
    }

    pub(crate) fn background_commands(&self) -> Vec<(String, BackgroundOptions)> {
        self.background.lock().clone()
    }

    pub(crate) fn was_hibernated(&self) -> bool {
        *self.hibernated.lock()
    }

    fn reply_for(&self, command: &str) -> Reply {
        {
            let mut once = self.once.lock();
            if let Some(i) = once.iter().position(|(p, _)| command.contains(p.as_str())) {
                return once.remove(i).1;
            }
        }
        self.always
            .lock()
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| Reply::ok(""))
    }
}

#[async_trait]
impl SandboxSession for ScriptedSession {
    fn sandbox_id(&self) -> &str {
        "scripted-sandbox"
    }

    fn sandbox_provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Mock
    }

    fn root_dir(&self) -> &str {
        "/home"
    }

    fn home_dir(&self) -> &str {
        "user"
    }

    fn repo_dir(&self) -> &str {
        "repo"
    }

    async fn run_command(&self, command: &str, options: CommandOptions) -> Result<String> {
        self.commands.lock().push(command.to_string());
        match self.reply_for(command) {
            Reply::Ok(stdout) => {
                if let Some(cb) = &options.on_stdout {
                    if !stdout.is_empty() {
                        cb(&stdout);
                    }
                }
                Ok(stdout)
            }
            Reply::Exit {
                code,
                stdout,
                stderr,
            } => Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code: code,
                stdout,
                stderr,
            }),
            Reply::Timeout => Err(SandboxError::Timeout {
                command: command.to_string(),
                timeout_ms: options.effective_timeout().as_millis() as u64,
            }),
        }
    }

    async fn run_background_command(
        &self,
        command: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        self.background
            .lock()
            .push((command.to_string(), options));
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        self.files
            .lock()
            .get(&resolved)
            .cloned()
            .ok_or_else(|| SandboxError::NonZeroExit {
                command: format!("cat {resolved}"),
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("cat: {resolved}: No such file or directory"),
            })
    }

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()> {
        self.put_file(path, contents);
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.put_file(path, &String::from_utf8_lossy(contents));
        Ok(())
    }

    async fn hibernate(&self) -> Result<()> {
        *self.hibernated.lock() = true;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
