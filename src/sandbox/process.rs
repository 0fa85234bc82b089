//! Spawning sandbox processes and pumping their stdio.
//!
//! A reader task decodes stdout lines into [`SessionEvent`]s, a writer
//! task serializes [`InboundRecord`]s onto stdin, and stderr is forwarded
//! to the log. The child is killed if the handle is dropped.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::mounts::{MountMode, ValidatedMount};
use super::protocol::{decode_line, encode_line, InboundRecord, SessionEvent};
use crate::config::SandboxConfig;

const EVENT_BUFFER: usize = 256;

/// Everything needed to launch one sandbox.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub session_id: String,
    pub workspace_id: String,
    pub mounts: Vec<ValidatedMount>,
    /// Host side of the session's IPC directory
    pub ipc_host_dir: PathBuf,
    /// Credentials the workspace is entitled to, as environment variables
    pub credentials: Vec<(String, String)>,
}

/// Fully resolved command line and environment.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct SandboxLauncher {
    config: SandboxConfig,
}

impl SandboxLauncher {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Container path reserved for the IPC mount.
    pub fn ipc_container_path(&self) -> &Path {
        &self.config.ipc_container_path
    }

    /// The IPC directory as seen from inside the sandbox.
    pub fn sandbox_ipc_dir(&self, ipc_host_dir: &Path) -> PathBuf {
        if self.config.mount_arg.is_some() {
            self.config.ipc_container_path.clone()
        } else {
            ipc_host_dir.to_path_buf()
        }
    }

    pub fn plan(&self, spec: &LaunchSpec) -> LaunchPlan {
        let ipc_dir = self.sandbox_ipc_dir(&spec.ipc_host_dir);
        let fill = |arg: &str| {
            arg.replace("{workspace}", &spec.workspace_id)
                .replace("{session_id}", &spec.session_id)
                .replace("{ipc_dir}", &ipc_dir.to_string_lossy())
        };

        let mount_args: Vec<String> = match &self.config.mount_arg {
            Some(template) => {
                let ipc_mount = (
                    spec.ipc_host_dir.as_path(),
                    self.config.ipc_container_path.as_path(),
                    MountMode::Rw,
                );
                spec.mounts
                    .iter()
                    .map(|m| (m.host_path.as_path(), m.container_path.as_path(), m.mode))
                    .chain(std::iter::once(ipc_mount))
                    .map(|(host, container, mode)| {
                        template
                            .replace("{host}", &host.to_string_lossy())
                            .replace("{container}", &container.to_string_lossy())
                            .replace("{mode}", mode.as_str())
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let mut args = Vec::with_capacity(self.config.args.len() + mount_args.len());
        let mut mounts_placed = false;
        for arg in &self.config.args {
            if arg == "{mounts}" {
                args.extend(mount_args.iter().cloned());
                mounts_placed = true;
            } else {
                args.push(fill(arg));
            }
        }
        if !mounts_placed {
            args.extend(mount_args);
        }

        let mut env: Vec<(String, String)> = self
            .config
            .env_passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        env.extend(spec.credentials.iter().cloned());
        env.push(("SANDHOST_SESSION_ID".to_string(), spec.session_id.clone()));
        env.push(("SANDHOST_WORKSPACE".to_string(), spec.workspace_id.clone()));
        env.push((
            "SANDHOST_IPC_DIR".to_string(),
            ipc_dir.to_string_lossy().into_owned(),
        ));

        LaunchPlan {
            program: self.config.program.clone(),
            args,
            env,
        }
    }

    pub fn spawn(&self, spec: &LaunchSpec) -> std::io::Result<SandboxProcess> {
        let plan = self.plan(spec);
        debug!(
            session = %spec.session_id,
            "Spawning sandbox: {} {}",
            plan.program,
            plan.args.join(" ")
        );

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .env_clear()
            .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        SandboxProcess::attach(child, &spec.session_id)
    }
}

/// A running sandbox with its stdio pumps.
pub struct SandboxProcess {
    child: Child,
    input: Option<mpsc::UnboundedSender<InboundRecord>>,
    events: mpsc::Receiver<SessionEvent>,
}

impl SandboxProcess {
    fn attach(mut child: Child, session_id: &str) -> std::io::Result<Self> {
        let missing = |name: &str| std::io::Error::other(format!("sandbox {name} not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<InboundRecord>();

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(session = %session, "Sandbox stdout read error: {e}");
                        break;
                    }
                }
                let Ok(line) = std::str::from_utf8(&buf) else {
                    warn!(
                        session = %session,
                        "Skipping sandbox output that is not UTF-8: {}",
                        String::from_utf8_lossy(&buf).trim_end()
                    );
                    continue;
                };
                match decode_line(line) {
                    Ok(Some(event)) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(
                        session = %session,
                        "Skipping malformed sandbox output ({e}): {}",
                        line.trim_end()
                    ),
                }
            }
            debug!(session = %session, "Sandbox stdout closed");
        });

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(record) = input_rx.recv().await {
                let line = match encode_line(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(session = %session, "Cannot encode record for sandbox: {e}");
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(session = %session, "Sandbox stdin write error: {e}");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(session = %session, "Sandbox stdin flush error: {e}");
                    break;
                }
            }
            // Dropping stdin delivers EOF
        });

        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session = %session, "sandbox stderr: {line}");
            }
        });

        Ok(Self {
            child,
            input: Some(input_tx),
            events: event_rx,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Queues a record for the sandbox. False once input is closed or
    /// the writer has stopped.
    pub fn send(&self, record: InboundRecord) -> bool {
        match &self.input {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    /// Closes stdin after everything already queued has been written.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    /// Next decoded output event; `None` once stdout is closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_exit(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Waits up to `timeout` for the process to exit on its own.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(timeout, self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        if self.try_exit().is_some() {
            return Ok(());
        }
        self.child.kill().await
    }
}
