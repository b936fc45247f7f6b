//! Docker sandbox provider: runs a local container as a sandbox.
//!
//! Uses [`bollard`] to manage containers. No API key required; only a
//! reachable Docker daemon. Containers idle on `sleep infinity` and every
//! command is a `docker exec`. Hibernate maps to pause; files move as
//! single-entry tar archives.

use super::{
    parent_dir, BackgroundOptions, CommandOptions, ProvisionRequest, Result, SandboxError,
    SandboxProvider, SandboxProviderKind, SandboxSession,
};
use crate::config::DockerConfig;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

const LABEL_MANAGED: &str = "terragon.sandbox";
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker-backed sandbox provider.
pub struct DockerSandboxProvider {
    docker: Docker,
    image: String,
}

impl DockerSandboxProvider {
    /// Connect using the default Docker socket path.
    pub fn new(config: &DockerConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| anyhow::anyhow!("Failed to connect to Docker: {e}"))?;
        Ok(Self {
            docker,
            image: config.image.clone(),
        })
    }

    fn session(&self, container_id: &str) -> DockerSandboxSession {
        DockerSandboxSession {
            docker: self.docker.clone(),
            id: container_id.to_string(),
        }
    }

    async fn pull_image(&self) {
        let mut pull_stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: self.image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = pull_stream.next().await {
            // Layer-already-exists and similar are reported per item; the
            // create below fails loudly if the image is really missing.
            if let Err(e) = item {
                tracing::debug!("Docker pull stream item: {e}");
            }
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Container
    }

    async fn create(&self, request: &ProvisionRequest) -> Result<Arc<dyn SandboxSession>> {
        self.pull_image().await;

        let mut labels: HashMap<String, String> = request
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let host_config = bollard::models::HostConfig {
            memory: Some((request.size.memory_mb() * 1024 * 1024) as i64),
            nano_cpus: Some(i64::from(request.size.cpu_count()) * 1_000_000_000),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                ContainerConfig {
                    image: Some(self.image.clone()),
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    labels: Some(labels),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::transport(format!("Failed to create Docker container: {e}")))?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::transport(format!("Failed to start Docker container: {e}")))?;

        tracing::info!(sandbox_id = %container.id, image = %self.image, "Created Docker sandbox");
        Ok(Arc::new(self.session(&container.id)))
    }

    async fn resume(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let inspect = self
            .docker
            .inspect_container(sandbox_id, None)
            .await
            .map_err(|e| docker_error(sandbox_id, "inspect container", e))?;

        let status = inspect.state.as_ref().and_then(|s| s.status);
        match status {
            Some(ContainerStateStatusEnum::RUNNING) => {}
            Some(ContainerStateStatusEnum::PAUSED) => self
                .docker
                .unpause_container(sandbox_id)
                .await
                .map_err(|e| docker_error(sandbox_id, "unpause container", e))?,
            _ => self
                .docker
                .start_container(sandbox_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| docker_error(sandbox_id, "start container", e))?,
        }

        tracing::info!(sandbox_id, ?status, "Resumed Docker sandbox");
        Ok(Arc::new(self.session(sandbox_id)))
    }

    async fn hibernate_by_id(&self, sandbox_id: &str) -> Result<()> {
        self.session(sandbox_id).hibernate().await
    }

    async fn extend_life(&self, sandbox_id: &str) -> Result<()> {
        // Local containers have no idle deadline; only confirm it exists.
        self.docker
            .inspect_container(sandbox_id, None)
            .await
            .map(|_| ())
            .map_err(|e| docker_error(sandbox_id, "inspect container", e))
    }
}

#[derive(Clone)]
pub struct DockerSandboxSession {
    docker: Docker,
    id: String,
}

impl DockerSandboxSession {
    async fn create_exec(&self, command: &str, cwd: &str, env: &BTreeMap<String, String>) -> Result<String> {
        self.docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    env: Some(exec_env(env)),
                    working_dir: Some(cwd.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map(|created| created.id)
            .map_err(|e| docker_error(&self.id, "create exec", e))
    }

    fn resolved_cwd(&self, cwd: Option<&str>) -> String {
        cwd.map(|c| self.resolve_path(c))
            .unwrap_or_else(|| self.repo_path())
    }
}

#[async_trait]
impl SandboxSession for DockerSandboxSession {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn sandbox_provider(&self) -> SandboxProviderKind {
        SandboxProviderKind::Container
    }

    fn root_dir(&self) -> &str {
        "/"
    }

    fn home_dir(&self) -> &str {
        "root"
    }

    fn repo_dir(&self) -> &str {
        "repo"
    }

    async fn run_command(&self, command: &str, options: CommandOptions) -> Result<String> {
        let timeout = options.effective_timeout();
        let cwd = self.resolved_cwd(options.cwd.as_deref());
        let exec_id = self.create_exec(command, &cwd, &options.env).await?;

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        let start_result = tokio::time::timeout(timeout, async {
            match self
                .docker
                .start_exec(&exec_id, None)
                .await
                .map_err(|e| docker_error(&self.id, "start exec", e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk.map_err(|e| docker_error(&self.id, "exec output", e))? {
                            LogOutput::StdOut { message } => {
                                let text = String::from_utf8_lossy(&message);
                                if let Some(cb) = &options.on_stdout {
                                    cb(&text);
                                }
                                stdout_buf.push_str(&text);
                            }
                            LogOutput::StdErr { message } => {
                                let text = String::from_utf8_lossy(&message);
                                if let Some(cb) = &options.on_stderr {
                                    cb(&text);
                                }
                                stderr_buf.push_str(&text);
                            }
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<(), SandboxError>(())
        })
        .await;

        match start_result {
            Err(_elapsed) => {
                return Err(SandboxError::Timeout {
                    command: command.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| docker_error(&self.id, "inspect exec", e))?;

        match inspect.exit_code.unwrap_or(0) {
            0 => Ok(stdout_buf),
            exit_code => Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code,
                stdout: stdout_buf,
                stderr: stderr_buf,
            }),
        }
    }

    async fn run_background_command(
        &self,
        command: &str,
        options: BackgroundOptions,
    ) -> Result<()> {
        let cwd = self.resolved_cwd(options.cwd.as_deref());
        let exec_id = self.create_exec(command, &cwd, &options.env).await?;
        let started = self
            .docker
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| docker_error(&self.id, "start exec", e))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Ok(());
        };

        let sandbox_id = self.id.clone();
        let timeout = options.effective_timeout();
        let on_output = options.on_output.clone();
        tokio::spawn(async move {
            let follow = async {
                while let Some(chunk) = output.next().await {
                    let message = match chunk {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => message,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Background exec stream failed");
                            return;
                        }
                    };
                    if let Some(cb) = &on_output {
                        cb(&String::from_utf8_lossy(&message));
                    }
                }
            };
            if tokio::time::timeout(timeout, follow).await.is_err() {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background command timed out; leaving process running"
                );
            }
        });
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        let mut stream = self.docker.download_from_container(
            &self.id,
            Some(DownloadFromContainerOptions {
                path: resolved.clone(),
            }),
        );

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| docker_error(&self.id, "download file", e))?;
            data.extend_from_slice(&bytes);
        }

        let bytes = first_file_from_tar(&data)
            .map_err(|e| SandboxError::transport(format!("Failed to unpack {resolved}: {e}")))?
            .ok_or_else(|| SandboxError::transport(format!("Not a regular file: {resolved}")))?;
        String::from_utf8(bytes)
            .map_err(|e| SandboxError::transport(format!("UTF-8 decode failed for {resolved}: {e}")))
    }

    async fn write_text_file(&self, path: &str, contents: &str) -> Result<()> {
        self.write_file(path, contents.as_bytes()).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let resolved = self.resolve_path(path);
        let dir = parent_dir(&resolved).to_string();
        let file_name = std::path::Path::new(&resolved)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SandboxError::transport(format!("Invalid file path: {resolved}")))?
            .to_string();

        self.run_command(
            &format!("mkdir -p {}", super::shell_quote(&dir)),
            CommandOptions::new().cwd("/").timeout(FILE_OP_TIMEOUT),
        )
        .await?;

        let tar_data = single_file_tar(&file_name, contents)
            .map_err(|e| SandboxError::transport(format!("Failed to build tar for {resolved}: {e}")))?;
        self.docker
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: dir,
                    ..Default::default()
                }),
                tar_data.into(),
            )
            .await
            .map_err(|e| docker_error(&self.id, "upload file", e))
    }

    async fn hibernate(&self) -> Result<()> {
        self.docker
            .pause_container(&self.id)
            .await
            .map_err(|e| docker_error(&self.id, "pause container", e))?;
        tracing::info!(sandbox_id = %self.id, "Paused Docker sandbox");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        match self
            .docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(sandbox_id = %self.id, "Removed Docker sandbox");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error(&self.id, "remove container", e)),
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

fn docker_error(sandbox_id: &str, action: &str, err: bollard::errors::Error) -> SandboxError {
    if is_not_found(&err) {
        SandboxError::NotFound(sandbox_id.to_string())
    } else {
        SandboxError::transport(format!("Failed to {action}: {err}"))
    }
}

fn exec_env(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

fn single_file_tar(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, name, contents)?;
    archive.into_inner()
}

/// Contents of the first regular file in a tar stream.
fn first_file_from_tar(data: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}
