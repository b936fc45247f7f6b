//! E2B sandbox provider: micro-VM sandboxes over the E2B REST API.
//!
//! Create/resume/pause/timeout calls hit the control plane; commands and
//! files go through the per-sandbox endpoints. The exec endpoint only
//! blocks, so background commands use [`super::background`].

use super::background::dispatch_detached;
use super::{
    BackgroundOptions, CommandOptions, ProvisionRequest, Result, SandboxError, SandboxProvider,
    SandboxProviderKind, SandboxSession,
};
use crate::config::E2bConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Slack on top of the command timeout before the HTTP call itself is abandoned.
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// Shared HTTP client and credentials for E2B API calls.
pub struct E2bApi {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    template: String,
    timeout_secs: u64,
}

impl E2bApi {
    fn url(&self, path: &str) -> String {
        format!("{}/v0{path}", self.api_base.trim_end_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

pub struct E2bSandboxProvider {
    api: Arc<E2bApi>,
}

impl E2bSandboxProvider {
    pub fn new(config: &E2bConfig) -> anyhow::Result<Self> {
        let api_key = config.effective_key();
        anyhow::ensure!(!api_key.is_empty(), "E2B_API_KEY is not set");

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build reqwest client: {e}"))?;

        Ok(Self {
            api: Arc::new(E2bApi {
                http,
                api_base: config.api_base.clone(),
                api_key,
                template: config.template.clone(),
                timeout_secs: config.timeout_secs,
            }),
        })
    }

    fn session(&self, sandbox_id: &str) -> E2bSandboxSession {
        E2bSandboxSession {
            api: self.api.clone(),
            id: sandbox_id.to_string(),
        }
    }
}

#[async_trait]
impl SandboxProvider for E2bSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::MicroVm
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<Arc<dyn SandboxSession>> {
        let body = serde_json::json!({
            "templateID": self.api.template,
            "timeout": self.api.timeout_secs,
            "metadata": request.labels,
            "cpuCount": request.size.cpu_count(),
            "memoryMB": request.size.memory_mb(),
        });

        let resp = self
            .api
            .post("/sandboxes")
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B create sandbox request failed: {e}")))?;
        let body_text = success_body(resp).await?;

        let parsed: serde_json::Value = serde_json::from_str(&body_text).map_err(|e| {
            SandboxError::transport(format!("Failed to parse E2B response: {e}\nBody: {body_text}"))
        })?;
        let sandbox_id = parsed["sandboxID"]
            .as_str()
            .or_else(|| parsed["sandbox_id"].as_str())
            .unwrap_or("")
            .to_string();
        if sandbox_id.is_empty() {
            return Err(SandboxError::transport(format!(
                "E2B returned no sandbox_id. Response: {body_text}"
            )));
        }

        tracing::info!(sandbox_id = %sandbox_id, template = %self.api.template, "Created E2B sandbox");
        Ok(Arc::new(self.session(&sandbox_id)))
    }

    async fn resume(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let resp = self
            .api
            .post(&format!("/sandboxes/{sandbox_id}/resume"))
            .json(&serde_json::json!({ "timeout": self.api.timeout_secs }))
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B resume request failed: {e}")))?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(SandboxError::NotFound(sandbox_id.to_string())),
            // Already running.
            StatusCode::CONFLICT => {}
            _ => {
                success_body(resp).await?;
            }
        }

        tracing::info!(sandbox_id, "Resumed E2B sandbox");
        Ok(Arc::new(self.session(sandbox_id)))
    }

    async fn hibernate_by_id(&self, sandbox_id: &str) -> Result<()> {
        self.session(sandbox_id).hibernate().await
    }

    async fn extend_life(&self, sandbox_id: &str) -> Result<()> {
        let resp = self
            .api
            .post(&format!("/sandboxes/{sandbox_id}/timeout"))
            .json(&serde_json::json!({ "timeout": self.api.timeout_secs }))
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B set timeout request failed: {e}")))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        success_body(resp).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct E2bSandboxSession {
    api: Arc<E2bApi>,
    id: String,
}

#[async_trait]
impl SandboxSession for E2bSandboxSession {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn sandbox_provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::MicroVm
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
        let timeout = options.effective_timeout();
        let workdir = options
            .cwd
            .as_deref()
            .map(|c| self.resolve_path(c))
            .unwrap_or_else(|| self.repo_path());

        let body = serde_json::json!({
            "cmd": command,
            "workdir": workdir,
            "envs": options.env,
            "timeout": timeout.as_secs().max(1),
        });

        let timed_out = || SandboxError::Timeout {
            command: command.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let resp = self
            .api
            .post(&format!("/sandboxes/{}/commands", self.id))
            .timeout(timeout + REQUEST_GRACE)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    timed_out()
                } else {
                    SandboxError::transport(format!("E2B run_command request failed: {e}"))
                }
            })?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(SandboxError::NotFound(self.id.clone())),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => return Err(timed_out()),
            _ => {}
        }
        let body_text = success_body(resp).await?;
        let parsed: serde_json::Value = serde_json::from_str(&body_text).map_err(|e| {
            SandboxError::transport(format!("Failed to parse E2B response: {e}\nBody: {body_text}"))
        })?;

        let stdout = parsed["stdout"].as_str().unwrap_or("").to_string();
        let stderr = parsed["stderr"].as_str().unwrap_or("").to_string();
        let exit_code = parsed["exitCode"]
            .as_i64()
            .or_else(|| parsed["exit_code"].as_i64())
            .unwrap_or(0);

        if let (Some(cb), false) = (&options.on_stdout, stdout.is_empty()) {
            cb(&stdout);
        }
        if let (Some(cb), false) = (&options.on_stderr, stderr.is_empty()) {
            cb(&stderr);
        }

        if exit_code != 0 {
            return Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
            });
        }
        Ok(stdout)
    }

    async fn run_background_command(
        &self,
        command: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        dispatch_detached(self, command, options).await
    }

    async fn read_text_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        let resp = self
            .api
            .get(&format!(
                "/sandboxes/{}/files?path={}",
                self.id,
                urlencoding::encode(&resolved)
            ))
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B read_file request failed: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::transport(format!("File not found: {resolved}")));
        }
        success_body(resp).await
    }

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()> {
        self.upload(path, contents.as_bytes().to_vec(), "text/plain").await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.upload(path, contents.to_vec(), "application/octet-stream")
            .await
    }

    async fn hibernate(&self) -> Result<()> {
        let resp = self
            .api
            .post(&format!("/sandboxes/{}/pause", self.id))
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B pause request failed: {e}")))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(SandboxError::NotFound(self.id.clone())),
            // Already paused.
            StatusCode::CONFLICT => Ok(()),
            _ => {
                success_body(resp).await?;
                tracing::info!(sandbox_id = %self.id, "Paused E2B sandbox");
                Ok(())
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let resp = self
            .api
            .http
            .delete(self.api.url(&format!("/sandboxes/{}", self.id)))
            .header("Authorization", format!("Bearer {}", self.api.api_key))
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B kill request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            tracing::info!(sandbox_id = %self.id, "Sandbox terminated");
            Ok(())
        } else {
            success_body(resp).await.map(|_| ())
        }
    }
}

impl E2bSandboxSession {
    async fn upload(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<()> {
        let resolved = self.resolve_path(path);
        let file_name = std::path::Path::new(&resolved)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("path", resolved.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(mime)
                    .map_err(|e| SandboxError::transport(format!("MIME type error: {e}")))?,
            );

        let resp = self
            .api
            .post(&format!("/sandboxes/{}/files", self.id))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SandboxError::transport(format!("E2B write_file request failed: {e}")))?;
        success_body(resp).await.map(|_| ())
    }
}

/// Read the body, failing with the status and body text on non-2xx.
async fn success_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body_text = resp
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable>".to_string());
    if !status.is_success() {
        return Err(SandboxError::transport(format!(
            "E2B API returned {status}: {body_text}"
        )));
    }
    Ok(body_text)
}
