//! Provider lookup by kind, gated on the deployment environment.

use super::daytona::DaytonaSandboxProvider;
use super::docker::DockerSandboxProvider;
use super::e2b::E2bSandboxProvider;
use super::mock::MockSandboxProvider;
use super::{Result, SandboxError, SandboxProvider, SandboxProviderKind};
use crate::config::{Environment, SandboxConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether `kind` may be used in `environment`. The mock backend runs
/// arbitrary commands on the host and is refused in production.
pub fn is_provider_allowed(kind: SandboxProviderKind, environment: Environment) -> bool {
    !(kind == SandboxProviderKind::Mock && environment == Environment::Prod)
}

/// Builds providers on first use and hands out shared handles afterwards.
pub struct ProviderRegistry {
    config: SandboxConfig,
    environment: Environment,
    cache: Mutex<HashMap<SandboxProviderKind, Arc<dyn SandboxProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: SandboxConfig) -> Self {
        let environment = config.environment;
        Self {
            config,
            environment,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Register a prebuilt provider, e.g. one pointed at a test server.
    pub fn with_provider(self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.cache.lock().insert(provider.kind(), provider);
        self
    }

    pub fn provider(&self, kind: SandboxProviderKind) -> Result<Arc<dyn SandboxProvider>> {
        if !is_provider_allowed(kind, self.environment) {
            return Err(SandboxError::ProviderNotAllowed {
                provider: kind,
                environment: self.environment,
            });
        }

        if let Some(existing) = self.cache.lock().get(&kind) {
            return Ok(existing.clone());
        }

        let provider: Arc<dyn SandboxProvider> = match kind {
            SandboxProviderKind::Container => Arc::new(DockerSandboxProvider::new(&self.config.docker)?),
            SandboxProviderKind::MicroVm => Arc::new(E2bSandboxProvider::new(&self.config.e2b)?),
            SandboxProviderKind::Workspace => Arc::new(DaytonaSandboxProvider::new(&self.config.daytona)?),
            SandboxProviderKind::Mock => Arc::new(MockSandboxProvider::new(self.config.mock.base_path())),
        };
        tracing::debug!(provider = %kind, environment = %self.environment, "Constructed sandbox provider");

        Ok(self
            .cache
            .lock()
            .entry(kind)
            .or_insert(provider)
            .clone())
    }
}
