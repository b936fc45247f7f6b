//! In-sandbox daemon: install, liveness, updates and messaging.
//!
//! The daemon script, the built-in MCP server script and the merged MCP
//! config live at fixed paths under the sandbox temp directory. Messages go
//! to the daemon over a unix socket; progress is observed only by tailing
//! the daemon log.

pub mod mcp;

use crate::config::DaemonConfig;
use crate::options::AgentKind;
use crate::sandbox::{
    join_path, shell_quote, BackgroundOptions, CommandOptions, SandboxError, SandboxSession,
};
use anyhow::Context;
use mcp::{build_merged_mcp_config, McpConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DAEMON_SCRIPT_NAME: &str = "terragon-daemon.mjs";
pub const MCP_SERVER_SCRIPT_NAME: &str = "terry-mcp-server.mjs";
pub const MCP_CONFIG_NAME: &str = "terry-mcp-config.json";
pub const DAEMON_LOG_NAME: &str = "terragon-daemon.log";
pub const DAEMON_SOCKET_NAME: &str = "terragon-daemon.sock";

/// Matches the daemon but not the shell running pgrep/pkill itself.
const DAEMON_PROCESS_PATTERN: &str = "[t]erragon-daemon.mjs";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Forwards stdin to the unix socket named by argv[1].
const SOCKET_PIPE_JS: &str =
    "const s=require('net').connect(process.argv[1]);s.on('error',e=>{console.error(e.message);process.exit(1)});process.stdin.pipe(s)";

/// Fixed file locations for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub daemon_script: String,
    pub mcp_server_script: String,
    pub mcp_config: String,
    pub log: String,
    pub socket: String,
}

impl DaemonPaths {
    pub fn new(temp_dir: &str) -> Self {
        Self {
            daemon_script: join_path(temp_dir, DAEMON_SCRIPT_NAME),
            mcp_server_script: join_path(temp_dir, MCP_SERVER_SCRIPT_NAME),
            mcp_config: join_path(temp_dir, MCP_CONFIG_NAME),
            log: join_path(temp_dir, DAEMON_LOG_NAME),
            socket: join_path(temp_dir, DAEMON_SOCKET_NAME),
        }
    }
}

/// Script contents shipped into the sandbox. Opaque to this crate.
#[derive(Debug, Clone, Default)]
pub struct DaemonAssets {
    pub daemon_script: String,
    pub mcp_server_script: String,
}

impl DaemonAssets {
    fn digests(&self) -> (String, String) {
        (sha256_hex(&self.daemon_script), sha256_hex(&self.mcp_server_script))
    }
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Per-launch inputs.
#[derive(Debug, Clone, Default)]
pub struct DaemonLaunch {
    /// Caller env; the fixed daemon keys override any of the same name.
    pub env: BTreeMap<String, String>,
    pub github_token: String,
    pub feature_flags: BTreeMap<String, serde_json::Value>,
    pub user_mcp_config: Option<McpConfig>,
    pub include_terry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonUpdate {
    /// Running and current.
    Unchanged,
    /// Was not running; installed and started.
    Started,
    /// Stale and auto-update enabled; replaced and restarted.
    Restarted,
    /// Stale but auto-update disabled; left running.
    LeftStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMessageType {
    Claude,
    Stop,
}

/// One message to the daemon socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMessage {
    #[serde(rename = "type")]
    pub message_type: DaemonMessageType,
    pub agent: AgentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    pub token: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Agent session to continue, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub thread_id: String,
    pub thread_chat_id: String,
}

pub struct DaemonClient {
    session: Arc<dyn SandboxSession>,
    paths: DaemonPaths,
    config: DaemonConfig,
}

impl DaemonClient {
    pub fn new(session: Arc<dyn SandboxSession>, config: &DaemonConfig) -> Self {
        let paths = DaemonPaths::new(&session.temp_dir());
        Self {
            session,
            paths,
            config: config.clone(),
        }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    async fn run(&self, command: &str) -> Result<String, SandboxError> {
        self.session
            .run_command(
                command,
                CommandOptions::new()
                    .cwd(self.session.home_path())
                    .timeout(CONTROL_TIMEOUT),
            )
            .await
    }

    /// Merged config for this launch.
    pub fn merged_mcp_config(&self, launch: &DaemonLaunch) -> McpConfig {
        build_merged_mcp_config(
            launch.user_mcp_config.as_ref(),
            launch.include_terry,
            &self.config.node_binary,
            &[self.paths.mcp_server_script.clone()],
        )
    }

    pub async fn write_mcp_config(&self, launch: &DaemonLaunch) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.merged_mcp_config(launch))?;
        self.session
            .write_text_file(&self.paths.mcp_config, &json)
            .await
            .context("writing MCP config")
    }

    /// Env the daemon is started with.
    pub fn launch_env(&self, launch: &DaemonLaunch) -> anyhow::Result<BTreeMap<String, String>> {
        let mut env = launch.env.clone();
        env.insert("TERRAGON".into(), "true".into());
        env.insert(
            "BASH_MAX_TIMEOUT_MS".into(),
            self.config.bash_max_timeout_ms.to_string(),
        );
        env.insert("GH_TOKEN".into(), launch.github_token.clone());
        env.insert(
            "TERRAGON_FEATURE_FLAGS".into(),
            serde_json::to_string(&launch.feature_flags)?,
        );
        Ok(env)
    }

    /// Write scripts and config, then start the daemon.
    pub async fn install(&self, assets: &DaemonAssets, launch: &DaemonLaunch) -> anyhow::Result<()> {
        self.session
            .write_text_file(&self.paths.daemon_script, &assets.daemon_script)
            .await
            .context("writing daemon script")?;
        self.session
            .write_text_file(&self.paths.mcp_server_script, &assets.mcp_server_script)
            .await
            .context("writing MCP server script")?;
        self.write_mcp_config(launch).await?;
        self.run(&format!("chmod +x {}", shell_quote(&self.paths.daemon_script)))
            .await?;
        self.start(launch).await
    }

    async fn start(&self, launch: &DaemonLaunch) -> anyhow::Result<()> {
        let command = format!(
            "{} {} --mcp-config-path {} >> {} 2>&1",
            shell_quote(&self.config.node_binary),
            shell_quote(&self.paths.daemon_script),
            shell_quote(&self.paths.mcp_config),
            shell_quote(&self.paths.log),
        );
        self.session
            .run_background_command(
                &command,
                BackgroundOptions::new()
                    .envs(&self.launch_env(launch)?)
                    .cwd(self.session.home_path()),
            )
            .await?;
        tracing::info!(sandbox_id = %self.session.sandbox_id(), "Started daemon");
        Ok(())
    }

    pub async fn is_running(&self) -> anyhow::Result<bool> {
        let pattern = shell_quote(DAEMON_PROCESS_PATTERN);
        match self.run(&format!("pgrep -f {pattern}")).await {
            Ok(out) => Ok(!out.trim().is_empty()),
            Err(SandboxError::NonZeroExit { exit_code: 1, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.run(&format!(
            "pkill -f {} || true",
            shell_quote(DAEMON_PROCESS_PATTERN)
        ))
        .await?;
        Ok(())
    }

    /// Whether the on-disk scripts differ from `assets`. Unreadable files
    /// count as different.
    pub async fn is_outdated(&self, assets: &DaemonAssets) -> bool {
        let (want_daemon, want_mcp) = assets.digests();
        let have_daemon = self.session.read_text_file(&self.paths.daemon_script).await;
        let have_mcp = self.session.read_text_file(&self.paths.mcp_server_script).await;
        match (have_daemon, have_mcp) {
            (Ok(d), Ok(m)) => sha256_hex(&d) != want_daemon || sha256_hex(&m) != want_mcp,
            _ => true,
        }
    }

    /// Ensure a daemon is running. A daemon that is not running is always
    /// (re)installed; a running stale one is only replaced when
    /// `auto_update` is set.
    pub async fn update_if_outdated(
        &self,
        assets: &DaemonAssets,
        launch: &DaemonLaunch,
        auto_update: bool,
    ) -> anyhow::Result<DaemonUpdate> {
        let sandbox_id = self.session.sandbox_id();
        if !self.is_running().await? {
            tracing::info!(sandbox_id = %sandbox_id, "Daemon not running, installing");
            self.install(assets, launch).await?;
            return Ok(DaemonUpdate::Started);
        }

        if !self.is_outdated(assets).await {
            self.write_mcp_config(launch).await?;
            return Ok(DaemonUpdate::Unchanged);
        }

        if !auto_update {
            tracing::warn!(sandbox_id = %sandbox_id, "Daemon is outdated; auto-update disabled, leaving it running");
            return Ok(DaemonUpdate::LeftStale);
        }

        tracing::info!(sandbox_id = %sandbox_id, "Daemon is outdated, restarting");
        self.stop().await?;
        self.install(assets, launch).await?;
        Ok(DaemonUpdate::Restarted)
    }

    /// Deliver `message` over the daemon socket. The payload goes through a
    /// temp file so no prompt text is ever interpolated into a command.
    pub async fn send_message(&self, message: &DaemonMessage) -> anyhow::Result<()> {
        let payload = serde_json::to_string(message)?;
        let path = join_path(
            &self.session.temp_dir(),
            &format!(
                "terragon-msg-{}.json",
                &uuid::Uuid::new_v4().simple().to_string()[..12]
            ),
        );
        self.session
            .write_text_file(&path, &payload)
            .await
            .context("writing daemon message")?;

        let send = self
            .run(&format!(
                "{} -e {} {} < {}",
                shell_quote(&self.config.node_binary),
                shell_quote(SOCKET_PIPE_JS),
                shell_quote(&self.paths.socket),
                shell_quote(&path),
            ))
            .await;
        if let Err(e) = self.run(&format!("rm -f {}", shell_quote(&path))).await {
            tracing::warn!(sandbox_id = %self.session.sandbox_id(), error = %e, "Failed to remove daemon message file");
        }
        send.context("sending message to daemon")?;

        tracing::info!(
            sandbox_id = %self.session.sandbox_id(),
            thread_id = %message.thread_id,
            agent = %message.agent,
            "Sent message to daemon"
        );
        Ok(())
    }

    /// Last `lines` lines of the daemon log.
    pub async fn tail_daemon_log(&self, lines: usize) -> anyhow::Result<String> {
        Ok(self
            .run(&format!(
                "tail -n {lines} {} 2>/dev/null || true",
                shell_quote(&self.paths.log)
            ))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::{Reply, ScriptedSession};

    fn assets() -> DaemonAssets {
        DaemonAssets {
            daemon_script: "console.log('daemon v2')".into(),
            mcp_server_script: "console.log('mcp')".into(),
        }
    }

    fn launch() -> DaemonLaunch {
        let mut env = BTreeMap::new();
        env.insert("GH_TOKEN".into(), "caller-token".into());
        env.insert("ANTHROPIC_API_KEY".into(), "sk-test".into());
        let mut feature_flags = BTreeMap::new();
        feature_flags.insert("fastMode".into(), serde_json::json!(true));
        DaemonLaunch {
            env,
            github_token: "ghs_real".into(),
            feature_flags,
            user_mcp_config: None,
            include_terry: true,
        }
    }

    fn client(session: &Arc<ScriptedSession>) -> DaemonClient {
        DaemonClient::new(session.clone(), &DaemonConfig::default())
    }

    #[test]
    fn paths_live_under_temp_dir() {
        let paths = DaemonPaths::new("/tmp");
        assert_eq!(paths.daemon_script, "/tmp/terragon-daemon.mjs");
        assert_eq!(paths.mcp_config, "/tmp/terry-mcp-config.json");
        assert_eq!(paths.log, "/tmp/terragon-daemon.log");
    }

    #[tokio::test]
    async fn install_writes_files_and_starts_with_fixed_env() {
        let session = Arc::new(ScriptedSession::new());
        let client = client(&session);
        client.install(&assets(), &launch()).await.unwrap();

        assert_eq!(
            session.file("/tmp/terragon-daemon.mjs").as_deref(),
            Some("console.log('daemon v2')")
        );
        let config: serde_json::Value =
            serde_json::from_str(&session.file("/tmp/terry-mcp-config.json").unwrap()).unwrap();
        assert_eq!(config["mcpServers"]["terry"]["args"][0], "/tmp/terry-mcp-server.mjs");
        assert!(session.ran("chmod +x '/tmp/terragon-daemon.mjs'"));

        let background = session.background_commands();
        assert_eq!(background.len(), 1);
        let (command, options) = &background[0];
        assert!(command.contains("--mcp-config-path '/tmp/terry-mcp-config.json'"));
        assert_eq!(options.env["TERRAGON"], "true");
        assert_eq!(options.env["GH_TOKEN"], "ghs_real");
        assert_eq!(options.env["ANTHROPIC_API_KEY"], "sk-test");
        assert_eq!(options.env["BASH_MAX_TIMEOUT_MS"], "3600000");
        assert_eq!(options.env["TERRAGON_FEATURE_FLAGS"], r#"{"fastMode":true}"#);
    }

    #[tokio::test]
    async fn stopped_daemon_is_started_even_without_auto_update() {
        let session = Arc::new(ScriptedSession::new());
        session.respond("pgrep", Reply::fail(1, "", ""));
        let update = client(&session)
            .update_if_outdated(&assets(), &launch(), false)
            .await
            .unwrap();
        assert_eq!(update, DaemonUpdate::Started);
        assert_eq!(session.background_commands().len(), 1);
    }

    #[tokio::test]
    async fn current_daemon_is_left_alone() {
        let session = Arc::new(ScriptedSession::new());
        session.respond("pgrep", Reply::ok("4242\n"));
        session.put_file("/tmp/terragon-daemon.mjs", &assets().daemon_script);
        session.put_file("/tmp/terry-mcp-server.mjs", &assets().mcp_server_script);
        let update = client(&session)
            .update_if_outdated(&assets(), &launch(), true)
            .await
            .unwrap();
        assert_eq!(update, DaemonUpdate::Unchanged);
        assert!(session.background_commands().is_empty());
        assert!(!session.ran("pkill"));
    }

    #[tokio::test]
    async fn stale_daemon_requires_opt_in() {
        let session = Arc::new(ScriptedSession::new());
        session.respond("pgrep", Reply::ok("4242\n"));
        session.put_file("/tmp/terragon-daemon.mjs", "console.log('daemon v1')");
        session.put_file("/tmp/terry-mcp-server.mjs", &assets().mcp_server_script);

        let update = client(&session)
            .update_if_outdated(&assets(), &launch(), false)
            .await
            .unwrap();
        assert_eq!(update, DaemonUpdate::LeftStale);
        assert_eq!(
            session.file("/tmp/terragon-daemon.mjs").as_deref(),
            Some("console.log('daemon v1')")
        );

        let update = client(&session)
            .update_if_outdated(&assets(), &launch(), true)
            .await
            .unwrap();
        assert_eq!(update, DaemonUpdate::Restarted);
        assert!(session.ran("pkill -f"));
        assert_eq!(
            session.file("/tmp/terragon-daemon.mjs").as_deref(),
            Some("console.log('daemon v2')")
        );
    }

    #[tokio::test]
    async fn send_message_pipes_temp_file_and_cleans_up() {
        let session = Arc::new(ScriptedSession::new());
        let message = DaemonMessage {
            message_type: DaemonMessageType::Claude,
            agent: AgentKind::Claude,
            agent_version: None,
            token: "tok".into(),
            prompt: "Fix the 'flaky' test; then run `make`".into(),
            model: Some("sonnet".into()),
            session_id: None,
            thread_id: "thread-1".into(),
            thread_chat_id: "chat-1".into(),
        };
        client(&session).send_message(&message).await.unwrap();

        let send = session
            .commands()
            .into_iter()
            .find(|c| c.contains("terragon-daemon.sock"))
            .unwrap();
        assert!(!send.contains("flaky"));
        let msg_path = send.rsplit(' ').next().unwrap().trim_matches('\'').to_string();
        let written: serde_json::Value =
            serde_json::from_str(&session.file(&msg_path).unwrap()).unwrap();
        assert_eq!(written["type"], "claude");
        assert_eq!(written["threadChatId"], "chat-1");
        assert!(written.get("sessionId").is_none());
        assert!(session.ran(&format!("rm -f '{msg_path}'")));
    }

    #[tokio::test]
    async fn failed_send_still_removes_temp_file() {
        let session = Arc::new(ScriptedSession::new());
        session.respond("terragon-daemon.sock", Reply::fail(1, "", "connect ENOENT"));
        let message = DaemonMessage {
            message_type: DaemonMessageType::Stop,
            agent: AgentKind::Codex,
            agent_version: None,
            token: "tok".into(),
            prompt: String::new(),
            model: None,
            session_id: None,
            thread_id: "t".into(),
            thread_chat_id: "c".into(),
        };
        assert!(client(&session).send_message(&message).await.is_err());
        assert!(session.ran("rm -f '/tmp/terragon-msg-"));
    }
}
