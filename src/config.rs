//! Configuration for sandbox providers, retries and the in-sandbox daemon.
//!
//! Loaded from a TOML file (default `<config dir>/terragon/config.toml`).
//! A missing file yields defaults; a malformed one is an error. API keys left
//! empty in the file fall back to `E2B_API_KEY` / `DAYTONA_API_KEY`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Deployment environment. Gates which sandbox providers may be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Prod,
    Dev,
    Test,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prod => "prod",
            Self::Dev => "dev",
            Self::Test => "test",
        })
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Self::Prod),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            other => anyhow::bail!("unknown environment: {other}"),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub environment: Environment,
    pub retry: RetryConfig,
    pub e2b: E2bConfig,
    pub daytona: DaytonaConfig,
    pub docker: DockerConfig,
    pub mock: MockConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Micro-VM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct E2bConfig {
    pub api_base: String,
    pub api_key: String,
    pub template: String,
    /// Idle lifetime granted on create, resume and extend.
    pub timeout_secs: u64,
}

impl Default for E2bConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.e2b.dev".to_string(),
            api_key: String::new(),
            template: "terragon-v1".to_string(),
            timeout_secs: 15 * 60,
        }
    }
}

impl E2bConfig {
    pub fn effective_key(&self) -> String {
        effective_key(&self.api_key, "E2B_API_KEY")
    }
}

/// Workspace backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaytonaConfig {
    pub api_base: String,
    pub api_key: String,
    pub snapshot: String,
    pub auto_stop_minutes: u32,
}

impl Default for DaytonaConfig {
    fn default() -> Self {
        Self {
            api_base: "https://app.daytona.io/api".to_string(),
            api_key: String::new(),
            snapshot: "terragon-v1".to_string(),
            auto_stop_minutes: 15,
        }
    }
}

impl DaytonaConfig {
    pub fn effective_key(&self) -> String {
        effective_key(&self.api_key, "DAYTONA_API_KEY")
    }
}

/// Container backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ghcr.io/terragon-labs/containers-test:latest".to_string(),
        }
    }
}

/// Local/mock backend: each sandbox is a directory under `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub base_dir: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir()
                .join("terragon-sandboxes")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

impl MockConfig {
    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.base_dir).into_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Exported to the daemon as `BASH_MAX_TIMEOUT_MS`.
    pub bash_max_timeout_ms: u64,
    pub node_binary: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bash_max_timeout_ms: 60 * 60 * 1000,
            node_binary: "node".to_string(),
        }
    }
}

fn effective_key(configured: &str, env_var: &str) -> String {
    if configured.is_empty() {
        std::env::var(env_var).unwrap_or_default()
    } else {
        configured.to_string()
    }
}

impl SandboxConfig {
    /// Default config file location, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "terragon", "terragon")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}
