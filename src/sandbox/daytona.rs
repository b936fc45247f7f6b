//! Daytona sandbox provider: cloud workspaces with session-based exec.
//!
//! Daytona only exposes exec through a stateful process session, so each
//! blocking command:
//!
//! 1. creates a session,
//! 2. `cd`s into the resolved working directory,
//! 3. `export`s every env var (sanitised key, single-quoted value),
//! 4. dispatches the command asynchronously,
//! 5. races log collection against a timer.
//!
//! On timeout the same [`SandboxError::Timeout`] shape as the other backends
//! is returned and the session is deleted best-effort.

use super::{
    export_line, shell_quote, BackgroundOptions, CommandOptions, OutputCallback,
    ProvisionRequest, Result, SandboxError, SandboxProvider, SandboxProviderKind, SandboxSession,
};
use crate::config::DaytonaConfig;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const START_TIMEOUT: Duration = Duration::from_secs(120);

pub struct DaytonaApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    snapshot: String,
    auto_stop_minutes: u32,
    poll_interval: Duration,
}

impl DaytonaApi {
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_base.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("Daytona {what} request failed: {e}")))
    }

    async fn sandbox_state(&self, sandbox_id: &str) -> Result<String> {
        let resp = self
            .send(self.request(Method::GET, &format!("/sandbox/{sandbox_id}")), "get sandbox")
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        let body = success_body(resp).await?;
        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            SandboxError::transport(format!("Failed to parse Daytona response: {e}\nBody: {body}"))
        })?;
        Ok(parsed["state"].as_str().unwrap_or("unknown").to_string())
    }
}

pub struct DaytonaSandboxProvider {
    api: Arc<DaytonaApi>,
}

impl DaytonaSandboxProvider {
    pub fn new(config: &DaytonaConfig) -> anyhow::Result<Self> {
        let api_key = config.effective_key();
        anyhow::ensure!(!api_key.is_empty(), "DAYTONA_API_KEY is not set");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build reqwest client: {e}"))?;

        Ok(Self {
            api: Arc::new(DaytonaApi {
                http,
                api_base: config.api_base.clone(),
                api_key,
                snapshot: config.snapshot.clone(),
                auto_stop_minutes: config.auto_stop_minutes,
                poll_interval: POLL_INTERVAL,
            }),
        })
    }

    fn session(&self, sandbox_id: &str) -> DaytonaSandboxSession {
        DaytonaSandboxSession {
            api: self.api.clone(),
            id: sandbox_id.to_string(),
        }
    }

    async fn wait_until_started(&self, sandbox_id: &str) -> Result<()> {
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            let state = self.api.sandbox_state(sandbox_id).await?;
            match state.as_str() {
                "started" => return Ok(()),
                "error" | "destroyed" => {
                    return Err(SandboxError::transport(format!(
                        "Daytona sandbox {sandbox_id} entered state {state}"
                    )))
                }
                _ if Instant::now() >= deadline => {
                    return Err(SandboxError::transport(format!(
                        "Daytona sandbox {sandbox_id} did not start within {}s (state: {state})",
                        START_TIMEOUT.as_secs()
                    )))
                }
                _ => tokio::time::sleep(self.api.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for DaytonaSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Workspace
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<Arc<dyn SandboxSession>> {
        let body = serde_json::json!({
            "snapshot": self.api.snapshot,
            "labels": request.labels,
            "cpu": request.size.cpu_count(),
            "memory": request.size.memory_mb() / 1024,
            "autoStopInterval": self.api.auto_stop_minutes,
        });
        let resp = self
            .api
            .send(self.api.request(Method::POST, "/sandbox").json(&body), "create sandbox")
            .await?;
        let body = success_body(resp).await?;
        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            SandboxError::transport(format!("Failed to parse Daytona response: {e}\nBody: {body}"))
        })?;
        let sandbox_id = parsed["id"].as_str().unwrap_or("").to_string();
        if sandbox_id.is_empty() {
            return Err(SandboxError::transport(format!(
                "Daytona returned no sandbox id. Response: {body}"
            )));
        }

        if parsed["state"].as_str() != Some("started") {
            self.wait_until_started(&sandbox_id).await?;
        }
        tracing::info!(sandbox_id = %sandbox_id, snapshot = %self.api.snapshot, "Created Daytona sandbox");
        Ok(Arc::new(self.session(&sandbox_id)))
    }

    async fn resume(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let state = self.api.sandbox_state(sandbox_id).await?;
        if state != "started" {
            let resp = self
                .api
                .send(
                    self.api
                        .request(Method::POST, &format!("/sandbox/{sandbox_id}/start")),
                    "start sandbox",
                )
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(SandboxError::NotFound(sandbox_id.to_string()));
            }
            success_body(resp).await?;
            self.wait_until_started(sandbox_id).await?;
        }
        tracing::info!(sandbox_id, previous_state = %state, "Resumed Daytona sandbox");
        Ok(Arc::new(self.session(sandbox_id)))
    }

    async fn hibernate_by_id(&self, sandbox_id: &str) -> Result<()> {
        self.session(sandbox_id).hibernate().await
    }

    async fn extend_life(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .api
            .send(
                self.api.request(
                    Method::POST,
                    &format!("/sandbox/{sandbox_id}/autostop/{}", self.api.auto_stop_minutes),
                ),
                "set autostop",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        success_body(resp).await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    cmd_id: Option<String>,
    exit_code: Option<i64>,
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandStatus {
    exit_code: Option<i64>,
}

/// Split session logs; structured logs carry separate streams, plain text
/// is treated as merged stdout.
fn parse_logs(body: &str) -> (String, String) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(v) if v.is_object() => (
            v["stdout"].as_str().unwrap_or("").to_string(),
            v["stderr"].as_str().unwrap_or("").to_string(),
        ),
        _ => (body.to_string(), String::new()),
    }
}

#[derive(Clone)]
pub struct DaytonaSandboxSession {
    api: Arc<DaytonaApi>,
    id: String,
}

impl DaytonaSandboxSession {
    fn session_path(&self, session_id: &str) -> String {
        format!("/toolbox/{}/toolbox/process/session/{session_id}", self.id)
    }

    async fn create_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .api
            .send(
                self.api
                    .request(Method::POST, &format!("/toolbox/{}/toolbox/process/session", self.id))
                    .json(&serde_json::json!({ "sessionId": session_id })),
                "create session",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        success_body(resp).await.map(|_| ())
    }

    async fn delete_session(&self, session_id: &str) {
        let result = self
            .api
            .send(
                self.api.request(Method::DELETE, &self.session_path(session_id)),
                "delete session",
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(sandbox_id = %self.id, session_id, error = %e, "Failed to delete exec session");
        }
    }

    async fn exec(&self, session_id: &str, command: &str, run_async: bool) -> Result<ExecResponse> {
        let resp = self
            .api
            .send(
                self.api
                    .request(Method::POST, &format!("{}/exec", self.session_path(session_id)))
                    .json(&serde_json::json!({ "command": command, "runAsync": run_async })),
                "session exec",
            )
            .await?;
        let body = success_body(resp).await?;
        serde_json::from_str(&body).map_err(|e| {
            SandboxError::transport(format!("Failed to parse Daytona exec response: {e}\nBody: {body}"))
        })
    }

    /// Create a session positioned in `cwd` with `env` exported.
    async fn prepared_session(
        &self,
        cwd: &str,
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<String> {
        let session_id = format!("terragon-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.create_session(&session_id).await?;

        let mut setup = vec![format!("cd {}", shell_quote(cwd))];
        setup.extend(env.iter().map(|(k, v)| export_line(k, v)));
        for step in setup {
            let resp = match self.exec(&session_id, &step, false).await {
                Ok(resp) => resp,
                Err(e) => {
                    self.delete_session(&session_id).await;
                    return Err(e);
                }
            };
            if let Some(code) = resp.exit_code.filter(|c| *c != 0) {
                self.delete_session(&session_id).await;
                return Err(SandboxError::NonZeroExit {
                    command: step,
                    exit_code: code,
                    stdout: resp.output.unwrap_or_default(),
                    stderr: String::new(),
                });
            }
        }
        Ok(session_id)
    }

    async fn command_exit_code(&self, session_id: &str, cmd_id: &str) -> Result<Option<i64>> {
        let resp = self
            .api
            .send(
                self.api.request(
                    Method::GET,
                    &format!("{}/command/{cmd_id}", self.session_path(session_id)),
                ),
                "command status",
            )
            .await?;
        let body = success_body(resp).await?;
        let status: CommandStatus = serde_json::from_str(&body).map_err(|e| {
            SandboxError::transport(format!("Failed to parse Daytona command status: {e}\nBody: {body}"))
        })?;
        Ok(status.exit_code)
    }

    async fn command_logs(&self, session_id: &str, cmd_id: &str) -> Result<(String, String)> {
        let resp = self
            .api
            .send(
                self.api.request(
                    Method::GET,
                    &format!("{}/command/{cmd_id}/logs", self.session_path(session_id)),
                ),
                "command logs",
            )
            .await?;
        Ok(parse_logs(&success_body(resp).await?))
    }

    /// Poll until the command has an exit code, forwarding new log output.
    async fn collect(
        &self,
        session_id: &str,
        cmd_id: &str,
        on_stdout: Option<OutputCallback>,
        on_stderr: Option<OutputCallback>,
    ) -> Result<(i64, String, String)> {
        let streaming = on_stdout.is_some() || on_stderr.is_some();
        let (mut sent_out, mut sent_err) = (0usize, 0usize);
        loop {
            let exit_code = self.command_exit_code(session_id, cmd_id).await?;
            if streaming || exit_code.is_some() {
                let (stdout, stderr) = self.command_logs(session_id, cmd_id).await?;
                forward_new(&on_stdout, &stdout, &mut sent_out);
                forward_new(&on_stderr, &stderr, &mut sent_err);
                if let Some(code) = exit_code {
                    return Ok((code, stdout, stderr));
                }
            }
            tokio::time::sleep(self.api.poll_interval).await;
        }
    }
}

/// Deliver the part of `text` past `sent` bytes.
fn forward_new(callback: &Option<OutputCallback>, text: &str, sent: &mut usize) {
    if let Some(cb) = callback {
        if text.len() > *sent {
            if let Some(new) = text.get(*sent..) {
                cb(new);
            }
            *sent = text.len();
        }
    }
}

#[async_trait]
impl SandboxSession for DaytonaSandboxSession {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn sandbox_provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Workspace
    }

    fn root_dir(&self) -> &str {
        "/home"
    }

    fn home_dir(&self) -> &str {
        "daytona"
    }

    fn repo_dir(&self) -> &str {
        "repo"
    }

    async fn run_command(&self, command: &str, options: CommandOptions) -> Result<String> {
        let timeout = options.effective_timeout();
        let cwd = options
            .cwd
            .as_deref()
            .map(|c| self.resolve_path(c))
            .unwrap_or_else(|| self.repo_path());

        let session_id = self.prepared_session(&cwd, &options.env).await?;
        let dispatched = match self.exec(&session_id, command, true).await {
            Ok(resp) => resp,
            Err(e) => {
                self.delete_session(&session_id).await;
                return Err(e);
            }
        };
        let Some(cmd_id) = dispatched.cmd_id else {
            self.delete_session(&session_id).await;
            return Err(SandboxError::transport("Daytona exec returned no cmdId"));
        };

        let outcome = tokio::select! {
            result = self.collect(&session_id, &cmd_id, options.on_stdout.clone(), options.on_stderr.clone()) => Some(result),
            _ = tokio::time::sleep(timeout) => None,
        };
        self.delete_session(&session_id).await;

        match outcome {
            None => {
                tracing::warn!(sandbox_id = %self.id, timeout_ms = timeout.as_millis() as u64, "Daytona command timed out");
                Err(SandboxError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Some(Err(e)) => Err(e),
            Some(Ok((0, stdout, _))) => Ok(stdout),
            Some(Ok((exit_code, stdout, stderr))) => Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
            }),
        }
    }

    async fn run_background_command(
        &self,
        command: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        let cwd = options
            .cwd
            .as_deref()
            .map(|c| self.resolve_path(c))
            .unwrap_or_else(|| self.repo_path());
        let session_id = self.prepared_session(&cwd, &options.env).await?;
        let dispatched = match self.exec(&session_id, command, true).await {
            Ok(resp) => resp,
            Err(e) => {
                self.delete_session(&session_id).await;
                return Err(e);
            }
        };

        let (Some(cmd_id), Some(on_output)) = (dispatched.cmd_id, options.on_output.clone()) else {
            return Ok(());
        };

        let this = self.clone();
        let timeout = options.effective_timeout();
        tokio::spawn(async move {
            let follow = this.collect(&session_id, &cmd_id, Some(on_output.clone()), Some(on_output));
            match tokio::time::timeout(timeout, follow).await {
                Ok(Ok((code, _, _))) => {
                    tracing::debug!(sandbox_id = %this.id, exit_code = code, "Background command exited");
                    this.delete_session(&session_id).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!(sandbox_id = %this.id, error = %e, "Background log follow failed")
                }
                Err(_) => tracing::warn!(
                    sandbox_id = %this.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background command timed out; leaving process running"
                ),
            }
        });
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        let resp = self
            .api
            .send(
                self.api.request(
                    Method::GET,
                    &format!(
                        "/toolbox/{}/toolbox/files/download?path={}",
                        self.id,
                        urlencoding::encode(&resolved)
                    ),
                ),
                "download file",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::transport(format!("File not found: {resolved}")));
        }
        success_body(resp).await
    }

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()> {
        self.write_file(path, contents.as_bytes()).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let resolved = self.resolve_path(path);
        let file_name = std::path::Path::new(&resolved)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(contents.to_vec()).file_name(file_name),
        );
        let resp = self
            .api
            .send(
                self.api
                    .request(
                        Method::POST,
                        &format!(
                            "/toolbox/{}/toolbox/files/upload?path={}",
                            self.id,
                            urlencoding::encode(&resolved)
                        ),
                    )
                    .multipart(form),
                "upload file",
            )
            .await?;
        success_body(resp).await.map(|_| ())
    }

    async fn hibernate(&self) -> Result<()> {
        let resp = self
            .api
            .send(
                self.api.request(Method::POST, &format!("/sandbox/{}/stop", self.id)),
                "stop sandbox",
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(self.id.clone()));
        }
        success_body(resp).await?;
        tracing::info!(sandbox_id = %self.id, "Stopped Daytona sandbox");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let resp = self
            .api
            .send(
                self.api.request(Method::DELETE, &format!("/sandbox/{}?force=true", self.id)),
                "delete sandbox",
            )
            .await?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::info!(sandbox_id = %self.id, "Deleted Daytona sandbox");
            return Ok(());
        }
        success_body(resp).await.map(|_| ())
    }
}

async fn success_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body_text = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable>".to_string());
    if !status.is_success() {
        return Err(SandboxError::transport(format!(
            "Daytona API returned {status}: {body_text}"
        )));
    }
    Ok(body_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn provider_for(server: &MockServer) -> DaytonaSandboxProvider {
        let mut provider = DaytonaSandboxProvider::new(&DaytonaConfig {
            api_base: server.uri(),
            api_key: "test-key".into(),
            ..Default::default()
        })
        .unwrap();
        if let Some(api) = Arc::get_mut(&mut provider.api) {
            api.poll_interval = Duration::from_millis(10);
        }
        provider
    }

    async fn mount_session_basics(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/toolbox/ws-1/toolbox/process/session"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/exec$"))
            .and(body_partial_json(serde_json::json!({ "runAsync": false })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "exitCode": 0, "output": "" })),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/exec$"))
            .and(body_partial_json(serde_json::json!({ "runAsync": true })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "cmdId": "cmd-1" })),
            )
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn run_command_exports_env_and_collects_output() {
        let server = MockServer::start().await;
        mount_session_basics(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/command/cmd-1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "exitCode": 0 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/command/cmd-1/logs$"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello from workspace\n"))
            .mount(&server)
            .await;

        let session = provider_for(&server).session("ws-1");
        let out = session
            .run_command(
                "echo hello",
                CommandOptions::new().env("my-key", "it's").cwd("sub"),
            )
            .await
            .unwrap();
        assert_eq!(out, "hello from workspace\n");

        let requests: Vec<Request> = server.received_requests().await.unwrap();
        let sync_commands: Vec<String> = requests
            .iter()
            .filter(|r| r.url.path().ends_with("/exec"))
            .filter_map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).ok())
            .filter(|v| v["runAsync"] == serde_json::json!(false))
            .filter_map(|v| v["command"].as_str().map(String::from))
            .collect();
        assert_eq!(
            sync_commands,
            vec![
                "cd '/home/daytona/repo/sub'".to_string(),
                r#"export my_key='it'"'"'s'"#.to_string(),
            ]
        );
        assert!(requests.iter().any(|r| r.method.as_str() == "DELETE"));
    }

    #[tokio::test]
    async fn run_command_maps_non_zero_exit_with_streams() {
        let server = MockServer::start().await;
        mount_session_basics(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/command/cmd-1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "exitCode": 2 })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/command/cmd-1/logs$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "partial",
                "stderr": "broken"
            })))
            .mount(&server)
            .await;

        let session = provider_for(&server).session("ws-1");
        let err = session
            .run_command("make", CommandOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        let msg = err.to_string();
        assert!(msg.contains("partial") && msg.contains("broken"));
    }

    #[tokio::test]
    async fn run_command_times_out_and_deletes_session() {
        let server = MockServer::start().await;
        mount_session_basics(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/toolbox/ws-1/toolbox/process/session/[^/]+/command/cmd-1$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "exitCode": null })))
            .mount(&server)
            .await;

        let session = provider_for(&server).session("ws-1");
        let err = session
            .run_command(
                "sleep 600",
                CommandOptions::new().timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("200ms"));

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().any(|r| r.method.as_str() == "DELETE"));
    }

    #[tokio::test]
    async fn resume_starts_stopped_sandbox() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/ws-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "state": "stopped" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sandbox/ws-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "state": "started" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sandbox/ws-1/start"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let session = provider_for(&server).resume("ws-1").await.unwrap();
        assert_eq!(session.sandbox_id(), "ws-1");
        assert_eq!(session.repo_path(), "/home/daytona/repo");
    }

    #[tokio::test]
    async fn resume_unknown_sandbox_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sandbox/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider_for(&server).resume("missing").await.err().unwrap();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[test]
    fn parse_logs_handles_plain_and_structured() {
        assert_eq!(parse_logs("merged"), ("merged".to_string(), String::new()));
        assert_eq!(
            parse_logs(r#"{"stdout":"a","stderr":"b"}"#),
            ("a".to_string(), "b".to_string())
        );
    }

    #[test]
    fn forward_new_only_sends_suffix() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let cb: Option<OutputCallback> = Some(Arc::new(move |s: &str| sink.lock().push(s.to_string())));
        let mut sent = 0;
        forward_new(&cb, "abc", &mut sent);
        forward_new(&cb, "abc", &mut sent);
        forward_new(&cb, "abcdef", &mut sent);
        assert_eq!(*seen.lock(), vec!["abc".to_string(), "def".to_string()]);
    }
}
