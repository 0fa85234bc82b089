use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::sandbox::mounts::{AllowedRoot, MountSpec};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub defaults: TimeoutDefaults,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Secrets available for injection, keyed by the environment
    /// variable name the sandbox sees. Supports ${ENV_VAR} substitution.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Global ceiling on live sandbox processes
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_ipc_poll_interval")]
    pub ipc_poll_interval_ms: u64,
    /// Delivery attempts per job before it is reported failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_secs: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: u64,
    /// Optional JSONL audit log of every session event and gate decision
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            data_dir: default_data_dir(),
            grace_period_secs: default_grace_period(),
            ipc_poll_interval_ms: default_ipc_poll_interval(),
            max_attempts: default_max_attempts(),
            retry_initial_delay_secs: default_retry_initial_delay(),
            retry_max_delay_secs: default_retry_max_delay(),
            audit_log: None,
        }
    }
}

/// How sandbox processes are launched.
///
/// `args` may contain `{workspace}`, `{session_id}` and `{ipc_dir}`
/// placeholders. When `mount_arg` is set, one argument per validated
/// mount (the IPC directory included) is generated with `{host}`,
/// `{container}` and `{mode}` filled in; they replace a `{mounts}` entry
/// in `args`, or are appended when there is none. Without `mount_arg` the
/// sandbox is assumed to share the host filesystem.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub mount_arg: Option<String>,
    #[serde(default = "default_ipc_container_path")]
    pub ipc_container_path: PathBuf,
    /// Host environment variables forwarded into the otherwise empty
    /// sandbox environment
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutDefaults {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            hard_timeout_secs: default_hard_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
    /// Tools whose results come from untrusted sources (sets `corruption`)
    #[serde(default = "default_untrusted_tools")]
    pub untrusted_tools: Vec<String>,
    /// Tools whose results expose sensitive data (sets `secret`)
    #[serde(default = "default_sensitive_tools")]
    pub sensitive_tools: Vec<String>,
    /// Judgment model for the last cascade tier. Without it, the local
    /// keyword heuristic is used.
    #[serde(default)]
    pub classifier: Option<ClassifierConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout(),
            untrusted_tools: default_untrusted_tools(),
            sensitive_tools: default_sensitive_tools(),
            classifier: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    /// `anthropic` or `ollama`
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution. Unused by ollama.
    #[serde(default)]
    pub api_key: String,
    /// Base URL override, ollama only
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_classifier_max_tokens")]
    pub max_tokens_per_request: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Folder id, also the key jobs are addressed to
    pub id: String,
    #[serde(default)]
    pub mount_allowlist: Vec<AllowedRoot>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub admin: bool,
    /// Names from `[credentials]` this workspace may receive
    #[serde(default)]
    pub credentials: Vec<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub hard_timeout_secs: Option<u64>,
}

/// A workspace with its effective timeouts resolved.
/// Immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: String,
    pub mount_allowlist: Vec<AllowedRoot>,
    pub mounts: Vec<MountSpec>,
    pub weight: u32,
    pub admin: bool,
    pub credentials: Vec<String>,
    pub idle_timeout: Duration,
    pub hard_timeout: Duration,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host.max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[error("workspace id must not be empty")]
    EmptyWorkspaceId,
    #[error("workspace `{0}` is declared more than once")]
    DuplicateWorkspace(String),
    #[error(
        "workspace `{workspace}`: idle timeout ({idle_secs}s) must be strictly less than hard timeout ({hard_secs}s)"
    )]
    InvalidTimeouts {
        workspace: String,
        idle_secs: u64,
        hard_secs: u64,
    },
}

fn default_max_concurrent() -> usize {
    3
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_grace_period() -> u64 {
    10
}

fn default_ipc_poll_interval() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay() -> u64 {
    5
}

fn default_retry_max_delay() -> u64 {
    300
}

fn default_ipc_container_path() -> PathBuf {
    PathBuf::from("/workspace/ipc")
}

fn default_env_passthrough() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_hard_timeout() -> u64 {
    1800
}

fn default_approval_timeout() -> u64 {
    300
}

fn default_untrusted_tools() -> Vec<String> {
    ["web_fetch", "web_search", "url_fetch", "read_email", "read_inbox"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_sensitive_tools() -> Vec<String> {
    ["read_secret", "read_credentials", "read_env", "read_private_file"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_classifier_max_tokens() -> u32 {
    16
}

fn default_weight() -> u32 {
    1
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses and validates a config document.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configs that would break scheduling or timeout invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        let mut seen = HashSet::new();
        for ws in &self.workspaces {
            if ws.id.trim().is_empty() {
                return Err(ConfigError::EmptyWorkspaceId);
            }
            if !seen.insert(ws.id.as_str()) {
                return Err(ConfigError::DuplicateWorkspace(ws.id.clone()));
            }
            let (idle_secs, hard_secs) = self.effective_timeouts(ws);
            if idle_secs >= hard_secs {
                return Err(ConfigError::InvalidTimeouts {
                    workspace: ws.id.clone(),
                    idle_secs,
                    hard_secs,
                });
            }
        }
        Ok(())
    }

    fn effective_timeouts(&self, ws: &WorkspaceConfig) -> (u64, u64) {
        (
            ws.idle_timeout_secs.unwrap_or(self.defaults.idle_timeout_secs),
            ws.hard_timeout_secs.unwrap_or(self.defaults.hard_timeout_secs),
        )
    }

    /// Resolves every workspace against the timeout defaults.
    pub fn resolve_workspaces(&self) -> Vec<Workspace> {
        self.workspaces
            .iter()
            .map(|ws| {
                let (idle_secs, hard_secs) = self.effective_timeouts(ws);
                Workspace {
                    id: ws.id.clone(),
                    mount_allowlist: ws.mount_allowlist.clone(),
                    mounts: ws.mounts.clone(),
                    weight: ws.weight,
                    admin: ws.admin,
                    credentials: ws.credentials.clone(),
                    idle_timeout: Duration::from_secs(idle_secs),
                    hard_timeout: Duration::from_secs(hard_secs),
                }
            })
            .collect()
    }
}

impl HostConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ipc_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ipc_poll_interval_ms.max(10))
    }
}
