//! Shared fixtures for unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SandboxConfig, Workspace};
use crate::ipc::dispatcher::Dispatcher;
use crate::observe::EventSink;
use crate::sandbox::process::SandboxLauncher;
use crate::sandbox::SessionContext;
use crate::security::TaintRules;

pub fn workspace(id: &str) -> Workspace {
    Workspace {
        id: id.to_string(),
        mount_allowlist: Vec::new(),
        mounts: Vec::new(),
        weight: 1,
        admin: false,
        credentials: Vec::new(),
        idle_timeout: Duration::from_secs(300),
        hard_timeout: Duration::from_secs(1800),
    }
}

/// Runs `script` with `/bin/sh -c` as the sandbox, sharing the host
/// filesystem.
pub fn sh_launcher(script: &str) -> SandboxLauncher {
    SandboxLauncher::new(SandboxConfig {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        mount_arg: None,
        ipc_container_path: PathBuf::from("/workspace/ipc"),
        env_passthrough: vec!["PATH".to_string()],
    })
}

pub fn session_context(
    launcher: SandboxLauncher,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn EventSink>,
    data_dir: &Path,
) -> SessionContext {
    SessionContext {
        launcher: Arc::new(launcher),
        dispatcher,
        sink,
        taint_rules: Arc::new(TaintRules::new(
            &["web_fetch".to_string()],
            &["read_secret".to_string()],
        )),
        data_dir: data_dir.to_path_buf(),
        grace_period: Duration::from_secs(2),
        ipc_poll_interval: Duration::from_millis(20),
    }
}
