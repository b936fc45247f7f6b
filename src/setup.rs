//! Sandbox setup after create or resume.
//!
//! On create the steps run in this order:
//!
//! 1. blobless clone, git identity, base-branch checkout, work branch
//! 2. agent CLI install
//! 3. every-time setup (below)
//! 4. repo or custom setup script
//!
//! Every-time setup runs on resume too: git credentials, env file, daemon
//! install/refresh, system prompt and agent config files. With
//! `fast_resume`, a resume only refreshes credentials and the daemon; the
//! files written by an earlier boot survive hibernation.

use crate::config::DaemonConfig;
use crate::daemon::{DaemonAssets, DaemonClient, DaemonLaunch, DaemonUpdate};
use crate::git::{fallback_branch_name, get_default_branch, validate_branch_name};
use crate::options::{BootingSubstatus, CreateSandboxOptions, SandboxStatus};
use crate::sandbox::{export_line, join_path, shell_quote, CommandOptions, SandboxSession};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

const CLONE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const AGENT_INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const SETUP_SCRIPT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const REPO_SETUP_SCRIPT: &str = "terragon-setup.sh";
const ENV_FILE: &str = ".terragon/env.sh";

pub struct SetupPipeline<'a> {
    session: Arc<dyn SandboxSession>,
    options: &'a CreateSandboxOptions,
    daemon: DaemonClient,
    assets: &'a DaemonAssets,
}

impl<'a> SetupPipeline<'a> {
    pub fn new(
        session: Arc<dyn SandboxSession>,
        options: &'a CreateSandboxOptions,
        daemon_config: &DaemonConfig,
        assets: &'a DaemonAssets,
    ) -> Self {
        let daemon = DaemonClient::new(session.clone(), daemon_config);
        Self {
            session,
            options,
            daemon,
            assets,
        }
    }

    /// Run setup for a sandbox that was just created (`created`) or resumed.
    pub async fn run(&self, created: bool) -> anyhow::Result<()> {
        if created {
            self.clone_repository().await?;
            self.checkout_branches().await?;
            self.install_agent().await?;
        }
        self.run_every_time_setup(created).await?;
        if created {
            self.run_setup_script().await?;
        }
        self.booting(BootingSubstatus::BootingDone).await
    }

    async fn booting(&self, substatus: BootingSubstatus) -> anyhow::Result<()> {
        tracing::info!(sandbox_id = %self.session.sandbox_id(), %substatus, "Booting");
        self.options
            .hooks
            .on_status_update(
                Some(self.session.sandbox_id()),
                SandboxStatus::Booting,
                Some(substatus),
            )
            .await
    }

    async fn exec(&self, command: &str, options: CommandOptions) -> anyhow::Result<String> {
        Ok(self.session.run_command(command, options).await?)
    }

    fn home_options(&self) -> CommandOptions {
        CommandOptions::new().cwd(self.session.home_path())
    }

    pub async fn clone_repository(&self) -> anyhow::Result<()> {
        self.booting(BootingSubstatus::CloningRepo).await?;
        self.write_git_credentials().await?;

        let clone = format!(
            "git clone --filter=blob:none {} {}",
            shell_quote(&self.options.clone_url()),
            shell_quote(&self.session.repo_path())
        );
        self.exec(
            &clone,
            self.home_options()
                .timeout(CLONE_TIMEOUT)
                .env("GIT_TERMINAL_PROMPT", "0"),
        )
        .await
        .with_context(|| format!("cloning {}", self.options.repo_full_name))?;

        let identity = &self.options.git_identity;
        self.exec(
            &format!(
                "git config user.name {} && git config user.email {}",
                shell_quote(&identity.name),
                shell_quote(&identity.email)
            ),
            CommandOptions::new(),
        )
        .await?;
        tracing::info!(sandbox_id = %self.session.sandbox_id(), repo = %self.options.repo_full_name, "Cloned repository");
        Ok(())
    }

    /// Check out the base branch, then create or check out the work branch.
    /// Returns the work branch name.
    pub async fn checkout_branches(&self) -> anyhow::Result<String> {
        let base = match &self.options.base_branch {
            Some(base) => base.clone(),
            None => get_default_branch(self.session.as_ref(), None).await,
        };
        validate_branch_name(&base)?;
        self.exec(
            &format!("git checkout {}", shell_quote(&base)),
            CommandOptions::new(),
        )
        .await
        .with_context(|| format!("checking out base branch {base}"))?;

        if !self.options.create_new_branch {
            return match &self.options.branch_name {
                Some(branch) if *branch != base => {
                    validate_branch_name(branch)?;
                    self.exec(
                        &format!("git checkout {}", shell_quote(branch)),
                        CommandOptions::new(),
                    )
                    .await
                    .with_context(|| format!("checking out branch {branch}"))?;
                    Ok(branch.clone())
                }
                _ => Ok(base),
            };
        }

        let branch = self.new_branch_name().await;
        validate_branch_name(&branch)?;
        self.exec(
            &format!("git checkout -b {}", shell_quote(&branch)),
            CommandOptions::new(),
        )
        .await
        .with_context(|| format!("creating branch {branch}"))?;
        tracing::info!(sandbox_id = %self.session.sandbox_id(), branch = %branch, base = %base, "Created work branch");
        Ok(branch)
    }

    async fn new_branch_name(&self) -> String {
        if let Some(name) = &self.options.branch_name {
            return name.clone();
        }
        match self.options.hooks.generate_branch_name().await {
            Ok(Some(name)) if !name.trim().is_empty() => name.trim().to_string(),
            Ok(_) => fallback_branch_name(),
            Err(e) => {
                tracing::warn!(error = %e, "Branch name generation failed, using fallback");
                fallback_branch_name()
            }
        }
    }

    pub async fn install_agent(&self) -> anyhow::Result<()> {
        if !self.options.install_agent {
            return Ok(());
        }
        self.booting(BootingSubstatus::InstallingAgent).await?;
        let command = self
            .options
            .agent
            .install_command(self.options.agent_version.as_deref());
        self.exec(&command, self.home_options().timeout(AGENT_INSTALL_TIMEOUT))
            .await
            .with_context(|| format!("installing {} CLI", self.options.agent))?;
        Ok(())
    }

    pub async fn run_every_time_setup(&self, created: bool) -> anyhow::Result<()> {
        if !created {
            self.write_git_credentials().await?;
        }

        let refresh_files = created || !self.options.fast_resume;
        if refresh_files {
            self.write_env_file().await?;
        }

        self.booting(BootingSubstatus::InstallingSandboxScripts).await?;
        let launch = self.daemon_launch();
        if created {
            self.daemon.install(self.assets, &launch).await?;
        } else {
            let update = self
                .daemon
                .update_if_outdated(self.assets, &launch, self.options.auto_update_daemon)
                .await?;
            tracing::info!(sandbox_id = %self.session.sandbox_id(), ?update, "Daemon checked");
            if update == DaemonUpdate::LeftStale {
                tracing::warn!(sandbox_id = %self.session.sandbox_id(), "Continuing with outdated daemon");
            }
        }

        if refresh_files {
            self.write_agent_files().await?;
        }
        Ok(())
    }

    fn daemon_launch(&self) -> DaemonLaunch {
        let mut env = self.options.env_vars.clone();
        env.extend(
            self.options
                .agent_credentials
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        DaemonLaunch {
            env,
            github_token: self.options.github_token.clone(),
            feature_flags: self.options.feature_flags.clone(),
            user_mcp_config: self.options.mcp_config.clone(),
            include_terry: true,
        }
    }

    async fn write_git_credentials(&self) -> anyhow::Result<()> {
        if self.options.github_token.is_empty() {
            return Ok(());
        }
        let path = join_path(&self.session.home_path(), ".git-credentials");
        self.session
            .write_text_file(
                &path,
                &format!(
                    "https://x-access-token:{}@github.com\n",
                    self.options.github_token
                ),
            )
            .await
            .context("writing git credentials")?;
        self.exec(
            &format!(
                "chmod 600 {} && git config --global credential.helper store",
                shell_quote(&path)
            ),
            self.home_options(),
        )
        .await?;
        Ok(())
    }

    /// `<home>/.terragon/env.sh`, sourced from `.bashrc`.
    pub async fn write_env_file(&self) -> anyhow::Result<()> {
        let home = self.session.home_path();
        let path = join_path(&home, ENV_FILE);
        let mut contents: String = self
            .options
            .env_vars
            .iter()
            .map(|(k, v)| export_line(k, v) + "\n")
            .collect();
        if contents.is_empty() {
            contents.push_str("# no environment variables configured\n");
        }
        self.session
            .write_text_file(&path, &contents)
            .await
            .context("writing env file")?;

        let source_line = format!("[ -f {p} ] && . {p}", p = shell_quote(&path));
        let bashrc = shell_quote(&join_path(&home, ".bashrc"));
        self.exec(
            &format!(
                "grep -qxF {line} {bashrc} 2>/dev/null || echo {line} >> {bashrc}",
                line = shell_quote(&source_line)
            ),
            self.home_options(),
        )
        .await?;
        Ok(())
    }

    async fn write_agent_files(&self) -> anyhow::Result<()> {
        let home = self.session.home_path();
        if let Some(prompt) = &self.options.system_prompt {
            let path = join_path(&home, self.options.agent.system_prompt_path());
            self.session
                .write_text_file(&path, prompt)
                .await
                .context("writing system prompt")?;
        }
        for file in &self.options.agent_config_files {
            let path = join_path(&home, &file.path);
            self.session
                .write_text_file(&path, &file.contents)
                .await
                .with_context(|| format!("writing agent config {}", file.path))?;
        }
        Ok(())
    }

    /// Custom script if given, else `terragon-setup.sh` from the repo root.
    pub async fn run_setup_script(&self) -> anyhow::Result<()> {
        let script_path = match &self.options.custom_setup_script {
            Some(script) => {
                let path = join_path(&self.session.temp_dir(), "terragon-custom-setup.sh");
                self.session
                    .write_text_file(&path, script)
                    .await
                    .context("writing custom setup script")?;
                path
            }
            None => {
                let exists = self
                    .session
                    .run_command(
                        &format!("test -f {}", shell_quote(REPO_SETUP_SCRIPT)),
                        CommandOptions::new(),
                    )
                    .await
                    .is_ok();
                if !exists {
                    return Ok(());
                }
                self.session.resolve_path(REPO_SETUP_SCRIPT)
            }
        };

        self.booting(BootingSubstatus::RunningSetupScript).await?;
        let sandbox_id = self.session.sandbox_id().to_string();
        let stderr_id = sandbox_id.clone();
        self.exec(
            &format!("bash {}", shell_quote(&script_path)),
            CommandOptions::new()
                .envs(&self.options.env_vars)
                .timeout(SETUP_SCRIPT_TIMEOUT)
                .on_stdout(Arc::new(move |chunk: &str| {
                    tracing::info!(sandbox_id = %sandbox_id, output = %chunk.trim_end(), "setup script");
                }))
                .on_stderr(Arc::new(move |chunk: &str| {
                    tracing::info!(sandbox_id = %stderr_id, output = %chunk.trim_end(), "setup script");
                })),
        )
        .await
        .context("setup script failed")?;
        Ok(())
    }
}
