//! Error taxonomy shared by sandbox adapters, git operations and MCP config
//! validation.
//!
//! Expected, classifiable outcomes (push conflicts, auth failures) are *not*
//! errors; see [`crate::git::PushResult`]. The types here are for conditions
//! callers either branch on by variant or let propagate.

use thiserror::Error;

use crate::sandbox::SandboxProviderKind;

/// Errors raised by [`crate::sandbox::SandboxSession`] and
/// [`crate::sandbox::SandboxProvider`] implementations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The command did not finish within its timeout.
    #[error("Command timed out after {timeout_ms}ms: {command}")]
    Timeout { command: String, timeout_ms: u64 },

    /// The command ran to completion but exited non-zero.
    #[error("Command failed with exit code {exit_code}: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    /// The sandbox does not exist (or no longer exists) at the provider.
    #[error("Sandbox not found: {0}")]
    NotFound(String),

    /// The provider cannot be constructed in the current environment.
    #[error("Sandbox provider {provider} is not allowed in the {environment} environment")]
    ProviderNotAllowed {
        provider: SandboxProviderKind,
        environment: crate::config::Environment,
    },

    /// Anything else the provider SDK or transport reported, passed through.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl SandboxError {
    /// Text used when classifying a failed command (both streams for exits,
    /// the rendered message otherwise).
    pub fn output_text(&self) -> String {
        match self {
            Self::NonZeroExit { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
            other => other.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether another attempt at the same provider call could succeed.
    /// A missing sandbox or a refused provider will not change on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::ProviderNotAllowed { .. })
    }

    pub fn exit_code(&self) -> Option<i64> {
        match self {
            Self::NonZeroExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub(crate) fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(anyhow::anyhow!("{message}"))
    }
}

/// Fatal git failures. Push outcomes are reported through
/// [`crate::git::PushResult`] instead.
#[derive(Debug, Error)]
pub enum GitError {
    /// A branch name contained characters that are unsafe to interpolate
    /// into a shell command.
    #[error("Invalid branch name {name:?}: contains {offending:?}")]
    InvalidBranchName { name: String, offending: char },

    /// Empty branch names are rejected outright.
    #[error("Branch name cannot be empty")]
    EmptyBranchName,

    /// `git fsck` reported corruption after a blob-materialising operation.
    #[error("Git integrity check failed after {operation}: {details}")]
    IntegrityCheckFailed { operation: String, details: String },

    /// `git commit` exited non-zero (typically a failing pre-commit hook).
    #[error("Failed to commit changes: {0}")]
    CommitFailed(String),

    /// A git command failed for a reason callers do not branch on.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Validation failures for user-supplied MCP server configs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum McpConfigError {
    #[error("MCP config is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("MCP config must be a JSON object with an \"mcpServers\" object")]
    MissingServers,

    #[error("MCP server name \"{0}\" is reserved")]
    ReservedName(String),

    #[error("MCP server \"{0}\" has a \"url\" but no \"type\". Add \"type\": \"http\" (or \"sse\") to this server entry")]
    UrlWithoutType(String),

    #[error("MCP server \"{name}\" has unsupported type \"{kind}\"; expected \"http\" or \"sse\"")]
    UnsupportedType { name: String, kind: String },

    #[error("MCP server \"{name}\" is invalid: {reason}")]
    InvalidServer { name: String, reason: String },
}
