//! Request and status types shared by the setup pipeline and orchestrator.

use crate::daemon::mcp::McpConfig;
use crate::git::{CommitAndPushOptions, CommitMessageGenerator, GitIdentity};
use crate::sandbox::{shell_quote, SandboxSize};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle tag persisted by callers. Variants are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxStatus {
    Unknown,
    Provisioning,
    Booting,
    Running,
    Paused,
    Killed,
}

/// Phase within [`SandboxStatus::Booting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootingSubstatus {
    Provisioning,
    ProvisioningDone,
    CloningRepo,
    InstallingAgent,
    InstallingSandboxScripts,
    RunningSetupScript,
    BootingDone,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Provisioning => "provisioning",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Killed => "killed",
        })
    }
}

impl fmt::Display for BootingSubstatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Provisioning => "provisioning",
            Self::ProvisioningDone => "provisioning-done",
            Self::CloningRepo => "cloning-repo",
            Self::InstallingAgent => "installing-agent",
            Self::InstallingSandboxScripts => "installing-sandbox-scripts",
            Self::RunningSetupScript => "running-setup-script",
            Self::BootingDone => "booting-done",
        })
    }
}

/// Coding agent CLI the daemon drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Codex,
    Gemini,
    Amp,
    Opencode,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Amp => "amp",
            Self::Opencode => "opencode",
        }
    }

    fn npm_package(&self) -> &'static str {
        match self {
            Self::Claude => "@anthropic-ai/claude-code",
            Self::Codex => "@openai/codex",
            Self::Gemini => "@google/gemini-cli",
            Self::Amp => "@sourcegraph/amp",
            Self::Opencode => "opencode-ai",
        }
    }

    /// Shell command that installs the CLI, pinned to `version` if given.
    pub fn install_command(&self, version: Option<&str>) -> String {
        let spec = format!("{}@{}", self.npm_package(), version.unwrap_or("latest"));
        format!("npm install -g {}", shell_quote(&spec))
    }

    /// Where the agent reads its system prompt, relative to the home dir.
    pub fn system_prompt_path(&self) -> &'static str {
        match self {
            Self::Claude => ".claude/CLAUDE.md",
            Self::Codex => ".codex/AGENTS.md",
            Self::Gemini => ".gemini/GEMINI.md",
            Self::Amp => ".config/amp/AGENTS.md",
            Self::Opencode => ".config/opencode/AGENTS.md",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            "amp" => Ok(Self::Amp),
            "opencode" => Ok(Self::Opencode),
            other => anyhow::bail!("unknown agent: {other}"),
        }
    }
}

/// A generated agent config file; contents are written verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    /// Relative to the sandbox home directory unless absolute.
    pub path: String,
    pub contents: String,
}

/// Callbacks into the caller during orchestration.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Called at every lifecycle transition. `sandbox_id` is `None` until
    /// the provider has assigned one.
    async fn on_status_update(
        &self,
        sandbox_id: Option<&str>,
        status: SandboxStatus,
        booting: Option<BootingSubstatus>,
    ) -> anyhow::Result<()>;

    /// Name for a newly created branch. `None` selects a generated name.
    async fn generate_branch_name(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Hooks that ignore every update.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {
    async fn on_status_update(
        &self,
        _sandbox_id: Option<&str>,
        _status: SandboxStatus,
        _booting: Option<BootingSubstatus>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything needed to create or resume a sandbox for one agent session.
#[derive(Clone)]
pub struct CreateSandboxOptions {
    /// `owner/name`.
    pub repo_full_name: String,
    /// Overrides `https://github.com/<repo_full_name>.git`.
    pub clone_url: Option<String>,
    /// Resolved from the remote when `None`.
    pub base_branch: Option<String>,
    pub create_new_branch: bool,
    pub branch_name: Option<String>,
    pub size: SandboxSize,
    pub env_vars: BTreeMap<String, String>,
    pub mcp_config: Option<McpConfig>,
    pub agent: AgentKind,
    pub agent_version: Option<String>,
    /// Skip for images that ship the agent CLI preinstalled.
    pub install_agent: bool,
    /// Extra env for the daemon, e.g. agent API keys.
    pub agent_credentials: BTreeMap<String, String>,
    pub github_token: String,
    pub feature_flags: BTreeMap<String, serde_json::Value>,
    pub custom_setup_script: Option<String>,
    pub auto_update_daemon: bool,
    pub fast_resume: bool,
    /// Resume this sandbox instead of creating one.
    pub sandbox_id: Option<String>,
    pub system_prompt: Option<String>,
    pub agent_config_files: Vec<AgentConfigFile>,
    pub git_identity: GitIdentity,
    pub co_author: Option<GitIdentity>,
    pub commit_message_generator: Option<Arc<dyn CommitMessageGenerator>>,
    pub hooks: Arc<dyn LifecycleHooks>,
}

impl CreateSandboxOptions {
    pub fn new(repo_full_name: impl Into<String>) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            clone_url: None,
            base_branch: None,
            create_new_branch: true,
            branch_name: None,
            size: SandboxSize::default(),
            env_vars: BTreeMap::new(),
            mcp_config: None,
            agent: AgentKind::default(),
            agent_version: None,
            install_agent: true,
            agent_credentials: BTreeMap::new(),
            github_token: String::new(),
            feature_flags: BTreeMap::new(),
            custom_setup_script: None,
            auto_update_daemon: false,
            fast_resume: false,
            sandbox_id: None,
            system_prompt: None,
            agent_config_files: Vec::new(),
            git_identity: GitIdentity::new("Terragon Labs", "noreply@terragonlabs.com"),
            co_author: None,
            commit_message_generator: None,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn clone_url(&self) -> String {
        self.clone_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.repo_full_name))
    }

    pub fn commit_and_push_options(&self) -> CommitAndPushOptions {
        CommitAndPushOptions {
            base_branch: self.base_branch.clone(),
            co_author: self.co_author.clone(),
            generator: self.commit_message_generator.clone(),
            repo_root: None,
        }
    }
}

impl fmt::Debug for CreateSandboxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateSandboxOptions")
            .field("repo_full_name", &self.repo_full_name)
            .field("base_branch", &self.base_branch)
            .field("create_new_branch", &self.create_new_branch)
            .field("branch_name", &self.branch_name)
            .field("size", &self.size)
            .field("env_vars", &self.env_vars.keys().collect::<Vec<_>>())
            .field("agent", &self.agent)
            .field("auto_update_daemon", &self.auto_update_daemon)
            .field("fast_resume", &self.fast_resume)
            .field("sandbox_id", &self.sandbox_id)
            .finish_non_exhaustive()
    }
}
