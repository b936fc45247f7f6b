//! Create-or-resume orchestration.
//!
//! Status flow seen by [`LifecycleHooks`]:
//!
//! ```text
//! create:  provisioning -> booting(provisioning-done) -> booting(...) -> running
//! resume:                                                booting(...) -> running
//! ```
//!
//! Only provider control-plane calls are retried. Any failure after that
//! propagates to the caller unchanged.

use crate::config::SandboxConfig;
use crate::daemon::{DaemonAssets, DaemonClient};
use crate::error::SandboxError;
use crate::git::{git_commit_and_push_branch, CommitAndPushOutcome, GitError};
use crate::options::{BootingSubstatus, CreateSandboxOptions, SandboxStatus};
use crate::retry::{retry_async_if, RetryPolicy};
use crate::sandbox::{
    ProviderRegistry, ProvisionRequest, SandboxProviderKind, SandboxSession,
};
use crate::setup::SetupPipeline;
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Orchestrator {
    registry: ProviderRegistry,
    config: SandboxConfig,
    assets: DaemonAssets,
}

impl Orchestrator {
    pub fn new(config: SandboxConfig, assets: DaemonAssets) -> Self {
        let registry = ProviderRegistry::new(config.clone());
        Self::with_registry(registry, config, assets)
    }

    pub fn with_registry(registry: ProviderRegistry, config: SandboxConfig, assets: DaemonAssets) -> Self {
        Self {
            registry,
            config,
            assets,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Resume `options.sandbox_id` if set, otherwise provision a new sandbox,
    /// then run setup and report `running`.
    pub async fn get_or_create_sandbox(
        &self,
        kind: SandboxProviderKind,
        options: &CreateSandboxOptions,
    ) -> anyhow::Result<Arc<dyn SandboxSession>> {
        let provider = self.registry.provider(kind)?;
        let hooks = &options.hooks;

        let (session, created) = match options.sandbox_id.as_deref() {
            Some(id) => {
                let policy = RetryPolicy::from_config(format!("resume {kind} sandbox"), &self.config.retry);
                let session =
                    retry_async_if(&policy, || provider.resume(id), SandboxError::is_retryable)
                        .await
                        .with_context(|| format!("resuming sandbox {id}"))?;
                tracing::info!(sandbox_id = %id, provider = %kind, "Resumed sandbox");
                (session, false)
            }
            None => {
                hooks
                    .on_status_update(None, SandboxStatus::Provisioning, None)
                    .await?;
                let request = ProvisionRequest {
                    size: options.size,
                    labels: provision_labels(options),
                };
                let policy = RetryPolicy::from_config(format!("create {kind} sandbox"), &self.config.retry);
                let session =
                    retry_async_if(&policy, || provider.create(&request), SandboxError::is_retryable)
                        .await
                        .with_context(|| format!("creating {kind} sandbox"))?;
                tracing::info!(sandbox_id = %session.sandbox_id(), provider = %kind, "Provisioned sandbox");
                hooks
                    .on_status_update(
                        Some(session.sandbox_id()),
                        SandboxStatus::Booting,
                        Some(BootingSubstatus::ProvisioningDone),
                    )
                    .await?;
                (session, true)
            }
        };

        SetupPipeline::new(session.clone(), options, &self.config.daemon, &self.assets)
            .run(created)
            .await
            .with_context(|| format!("setting up sandbox {}", session.sandbox_id()))?;

        hooks
            .on_status_update(Some(session.sandbox_id()), SandboxStatus::Running, None)
            .await?;
        tracing::info!(sandbox_id = %session.sandbox_id(), provider = %kind, created, "Sandbox running");
        Ok(session)
    }

    pub async fn hibernate(&self, kind: SandboxProviderKind, sandbox_id: &str) -> anyhow::Result<()> {
        self.registry.provider(kind)?.hibernate_by_id(sandbox_id).await?;
        tracing::info!(sandbox_id, provider = %kind, "Hibernated sandbox");
        Ok(())
    }

    pub async fn extend_life(&self, kind: SandboxProviderKind, sandbox_id: &str) -> anyhow::Result<()> {
        self.registry.provider(kind)?.extend_life(sandbox_id).await?;
        Ok(())
    }

    /// Commit outstanding work on the session's current branch and push it.
    pub async fn commit_and_push(
        &self,
        session: &dyn SandboxSession,
        options: &CreateSandboxOptions,
    ) -> Result<CommitAndPushOutcome, GitError> {
        git_commit_and_push_branch(session, &options.commit_and_push_options()).await
    }

    pub fn daemon(&self, session: Arc<dyn SandboxSession>) -> DaemonClient {
        DaemonClient::new(session, &self.config.daemon)
    }
}

fn provision_labels(options: &CreateSandboxOptions) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("repo".to_string(), options.repo_full_name.clone());
    labels.insert("agent".to_string(), options.agent.to_string());
    labels
}
