//! Operator CLI for creating, resuming and syncing sandboxes by hand.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use terragon_sandbox::daemon::mcp::parse_mcp_config_str;
use terragon_sandbox::git::{git_commit_and_push_branch, git_diff_stats, CommitAndPushOptions};
use terragon_sandbox::{
    AgentKind, BootingSubstatus, CreateSandboxOptions, DaemonAssets, LifecycleHooks,
    Orchestrator, SandboxConfig, SandboxProviderKind, SandboxSize, SandboxStatus,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sandbox backend: docker, e2b, daytona or mock
    #[arg(long, global = true, default_value = "e2b")]
    provider: SandboxProviderKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a sandbox and clone a repository into it
    Create {
        /// Repository as owner/name
        repo: String,

        #[command(flatten)]
        setup: SetupArgs,
    },

    /// Resume a hibernated sandbox and refresh its daemon
    Resume {
        sandbox_id: String,

        /// Repository as owner/name
        repo: String,

        /// Skip rewriting env, prompt and agent config files
        #[arg(long)]
        fast: bool,

        #[command(flatten)]
        setup: SetupArgs,
    },

    /// Suspend a sandbox
    Hibernate { sandbox_id: String },

    /// Push back a sandbox's auto-stop deadline
    Extend { sandbox_id: String },

    /// Commit outstanding changes and push the current branch
    Push {
        sandbox_id: String,

        /// Branch the work started from
        #[arg(long)]
        base: Option<String>,
    },

    /// Summarise changes against a base branch
    DiffStats {
        sandbox_id: String,

        #[arg(long, default_value = "main")]
        base: String,
    },
}

#[derive(Args)]
struct SetupArgs {
    /// Daemon script to install in the sandbox
    #[arg(long, value_name = "FILE")]
    daemon_script: PathBuf,

    /// Built-in MCP server script to install alongside the daemon
    #[arg(long, value_name = "FILE")]
    mcp_server_script: PathBuf,

    /// User MCP config (JSON with an "mcpServers" object)
    #[arg(long, value_name = "FILE")]
    mcp_config: Option<PathBuf>,

    #[arg(long, default_value = "claude")]
    agent: AgentKind,

    #[arg(long)]
    agent_version: Option<String>,

    /// Base branch (defaults to the remote's default branch)
    #[arg(long)]
    base: Option<String>,

    /// Work branch name (generated when omitted)
    #[arg(long)]
    branch: Option<String>,

    /// Check out --branch instead of creating it
    #[arg(long)]
    existing_branch: bool,

    /// Clone from this URL instead of GitHub
    #[arg(long)]
    clone_url: Option<String>,

    #[arg(long)]
    large: bool,

    /// Environment variable for the sandbox (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Replace a running daemon whose scripts are out of date
    #[arg(long)]
    auto_update_daemon: bool,

    /// The agent CLI is already installed in the image
    #[arg(long)]
    skip_agent_install: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

/// Reports lifecycle transitions through the log.
struct LogHooks;

#[async_trait]
impl LifecycleHooks for LogHooks {
    async fn on_status_update(
        &self,
        sandbox_id: Option<&str>,
        status: SandboxStatus,
        booting: Option<BootingSubstatus>,
    ) -> Result<()> {
        match booting {
            Some(substatus) => tracing::info!(sandbox_id = ?sandbox_id, %status, %substatus, "Status"),
            None => tracing::info!(sandbox_id = ?sandbox_id, %status, "Status"),
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

impl SetupArgs {
    fn assets(&self) -> Result<DaemonAssets> {
        Ok(DaemonAssets {
            daemon_script: read_file(&self.daemon_script)?,
            mcp_server_script: read_file(&self.mcp_server_script)?,
        })
    }

    fn options(&self, repo: &str) -> Result<CreateSandboxOptions> {
        let mut options = CreateSandboxOptions::new(repo);
        options.clone_url = self.clone_url.clone();
        options.base_branch = self.base.clone();
        options.branch_name = self.branch.clone();
        options.create_new_branch = !self.existing_branch;
        options.agent = self.agent;
        options.agent_version = self.agent_version.clone();
        options.install_agent = !self.skip_agent_install;
        options.auto_update_daemon = self.auto_update_daemon;
        options.size = if self.large {
            SandboxSize::Large
        } else {
            SandboxSize::Small
        };
        options.env_vars = self.env.iter().cloned().collect::<BTreeMap<_, _>>();
        options.github_token = std::env::var("GH_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .unwrap_or_default();
        if let Some(path) = &self.mcp_config {
            options.mcp_config = Some(
                parse_mcp_config_str(&read_file(path)?)
                    .with_context(|| format!("Invalid MCP config {}", path.display()))?,
            );
        }
        options.hooks = std::sync::Arc::new(LogHooks);
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("terragon_sandbox=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SandboxConfig::load(cli.config.as_deref())?;
    let kind = cli.provider;

    match cli.command {
        Commands::Create { repo, setup } => {
            let orchestrator = Orchestrator::new(config, setup.assets()?);
            let session = orchestrator
                .get_or_create_sandbox(kind, &setup.options(&repo)?)
                .await?;
            println!("{}", session.sandbox_id());
        }
        Commands::Resume {
            sandbox_id,
            repo,
            fast,
            setup,
        } => {
            let mut options = setup.options(&repo)?;
            options.sandbox_id = Some(sandbox_id);
            options.fast_resume = fast;
            let orchestrator = Orchestrator::new(config, setup.assets()?);
            let session = orchestrator.get_or_create_sandbox(kind, &options).await?;
            println!("{}", session.sandbox_id());
        }
        Commands::Hibernate { sandbox_id } => {
            Orchestrator::new(config, DaemonAssets::default())
                .hibernate(kind, &sandbox_id)
                .await?;
        }
        Commands::Extend { sandbox_id } => {
            Orchestrator::new(config, DaemonAssets::default())
                .extend_life(kind, &sandbox_id)
                .await?;
        }
        Commands::Push { sandbox_id, base } => {
            let orchestrator = Orchestrator::new(config, DaemonAssets::default());
            let session = orchestrator.registry().provider(kind)?.resume(&sandbox_id).await?;
            let options = CommitAndPushOptions {
                base_branch: base,
                ..Default::default()
            };
            let outcome = git_commit_and_push_branch(session.as_ref(), &options).await?;
            match &outcome.push {
                Some(push) => println!("{}", serde_json::to_string_pretty(push)?),
                None => println!("{} is up to date", outcome.branch_name),
            }
        }
        Commands::DiffStats { sandbox_id, base } => {
            let orchestrator = Orchestrator::new(config, DaemonAssets::default());
            let session = orchestrator.registry().provider(kind)?.resume(&sandbox_id).await?;
            let stats = git_diff_stats(session.as_ref(), &base, None).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}
