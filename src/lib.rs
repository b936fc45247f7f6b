//! Sandbox orchestration core for autonomous coding agents.
//!
//! Provisions or resumes a sandbox on one of several backends, clones the
//! target repository into it, installs the in-sandbox daemon that drives the
//! agent CLI, and syncs the agent's work back to the remote with
//! integrity-checked commits and rebase-on-rejection pushes.
//!
//! The entry point is [`Orchestrator::get_or_create_sandbox`]. Lower layers
//! ([`sandbox`], [`git`], [`daemon`], [`setup`]) are public for callers that
//! drive a session directly.

pub mod config;
pub mod daemon;
pub mod error;
pub mod git;
pub mod options;
pub mod orchestrator;
pub mod retry;
pub mod sandbox;
pub mod setup;

pub use config::{Environment, SandboxConfig};
pub use daemon::{DaemonAssets, DaemonClient, DaemonMessage};
pub use error::{GitError, McpConfigError, SandboxError};
pub use options::{
    AgentKind, BootingSubstatus, CreateSandboxOptions, LifecycleHooks, NoopHooks, SandboxStatus,
};
pub use orchestrator::Orchestrator;
pub use retry::{retry_async, retry_async_if, RetryPolicy};
pub use sandbox::{
    ProviderRegistry, SandboxProvider, SandboxProviderKind, SandboxSession, SandboxSize,
};
