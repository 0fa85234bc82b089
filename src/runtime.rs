use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ipc::handlers::OutboundMessage;
use crate::queue::GroupQueue;
use crate::security::{ApprovalBroker, ApprovalRequest};

/// A job as typed on the control channel.
#[derive(Debug, Deserialize)]
struct JobLine {
    workspace: String,
    payload: String,
    #[serde(default)]
    priority: i32,
}

/// Operator console: reads jobs and slash commands line by line, and
/// prints approval requests and agent messages as they arrive.
pub struct Runtime {
    queue: GroupQueue,
    approvals: Arc<ApprovalBroker>,
    classifier: String,
    /// Registered IPC request types with their descriptions
    handlers: Vec<(String, String)>,
    start_time: std::time::Instant,
}

impl Runtime {
    pub fn new(
        queue: GroupQueue,
        approvals: Arc<ApprovalBroker>,
        classifier: String,
        handlers: Vec<(String, String)>,
    ) -> Self {
        Self {
            queue,
            approvals,
            classifier,
            handlers,
            start_time: std::time::Instant::now(),
        }
    }

    /// Runs until the input ends.
    pub async fn run<R, W>(
        &self,
        input: R,
        mut output: W,
        mut approval_rx: mpsc::UnboundedReceiver<ApprovalRequest>,
        mut outbox_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Control loop started, type /help for commands");
        let mut lines = input.lines();

        loop {
            let text = tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => self.handle_line(line.trim()).await,
                    None => break,
                },
                Some(request) = approval_rx.recv() => format_approval(&request),
                Some(message) = outbox_rx.recv() => format!(
                    "[{} → {}] {}",
                    message.from_workspace, message.to_workspace, message.text
                ),
            };
            output.write_all(text.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }

        info!("Control input closed");
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> String {
        let result = if line.starts_with('/') {
            self.handle_command(line).await
        } else {
            self.handle_job(line)
        };
        result.unwrap_or_else(|e| format!("Error: {e}"))
    }

    fn handle_job(&self, line: &str) -> Result<String> {
        let job: JobLine = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("expected a JSON job or a /command ({e})"))?;
        let id = self.queue.enqueue(&job.workspace, job.payload, job.priority)?;
        Ok(format!("Queued job {id} for {}", job.workspace))
    }

    // ── Slash commands ────────────────────────────────────

    async fn handle_command(&self, body: &str) -> Result<String> {
        let mut parts = body.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.next();

        info!("Operator command: {command}");

        match (command.as_str(), arg) {
            ("/approve", Some(id)) => self.cmd_resolve(id, true).await,
            ("/deny", Some(id)) => self.cmd_resolve(id, false).await,
            ("/approve" | "/deny", None) => Ok(format!("Usage: {command} <request-id>")),
            ("/pending", _) => Ok(self.cmd_pending().await),
            ("/status", _) => self.cmd_status().await,
            ("/help", _) => Ok(cmd_help()),
            _ => Ok(format!(
                "Unknown command: {command}\nType /help for available commands."
            )),
        }
    }

    /// /approve, /deny
    async fn cmd_resolve(&self, id: &str, approve: bool) -> Result<String> {
        let request = self.approvals.resolve(id, approve).await?;
        Ok(format!(
            "{} `{}` for workspace {}",
            if approve { "Approved" } else { "Denied" },
            request.command,
            request.workspace_id
        ))
    }

    /// /pending
    async fn cmd_pending(&self) -> String {
        let pending = self.approvals.pending().await;
        if pending.is_empty() {
            return "No pending approvals".to_string();
        }
        pending
            .iter()
            .map(|r| {
                format!(
                    "{}  [{}] `{}` ({}), expires {}",
                    r.id,
                    r.workspace_id,
                    r.command,
                    r.reason,
                    r.expires_at.format("%H:%M:%S")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// /status
    async fn cmd_status(&self) -> Result<String> {
        let uptime = self.start_time.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;
        let status = self.queue.status().await?;
        let queued = status
            .queued
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(ws, n)| format!("{ws}={n}"))
            .collect::<Vec<_>>();
        let handlers = self
            .handlers
            .iter()
            .map(|(name, description)| format!("\n  {name}: {description}"))
            .collect::<String>();

        Ok(format!(
            "sandhost — status\n\
             Uptime: {hours}h {minutes}m\n\
             Classifier: {}\n\
             Sessions: {} running, {} idle\n\
             Queued: {}\n\
             Jobs: {} completed, {} failed\n\
             Pending approvals: {}\n\
             IPC handlers:{}",
            self.classifier,
            status.running,
            status.idle,
            if queued.is_empty() { "none".to_string() } else { queued.join(", ") },
            status.completed,
            status.failed,
            self.approvals.pending().await.len(),
            if handlers.is_empty() { " none".to_string() } else { handlers },
        ))
    }
}

fn format_approval(request: &ApprovalRequest) -> String {
    warn!(
        workspace = %request.workspace_id,
        "Approval needed for `{}` ({})",
        request.command,
        request.reason
    );
    format!(
        "Approval needed [{}] workspace {}: `{}` ({})\n  /approve {} or /deny {}",
        request.id, request.workspace_id, request.command, request.reason, request.id, request.id
    )
}

/// /help
fn cmd_help() -> String {
    "\
Commands:\n\
  /approve <id>  — Allow a command waiting for approval\n\
  /deny <id>     — Refuse a command waiting for approval\n\
  /pending       — List commands waiting for approval\n\
  /status        — Queue and session overview\n\
  /help          — This message\n\
Jobs:\n\
  {\"workspace\": \"main\", \"payload\": \"...\", \"priority\": 0}"
        .to_string()
}
