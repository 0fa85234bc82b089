use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;

use crate::ipc::{Decision, HandlerReply, IpcError, IpcHandler, RequestContext};

pub const REQUEST_TYPE: &str = "send_message";

/// A message a sandbox asked the host to deliver to a workspace's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub from_workspace: String,
    pub to_workspace: String,
    pub session_id: String,
    pub text: String,
}

#[derive(Deserialize)]
struct Payload {
    /// Target workspace, defaults to the sender's own
    #[serde(default)]
    to: Option<String>,
    text: String,
}

/// Forwards agent messages to the outbound channel. Only admin
/// workspaces may address a workspace other than their own.
pub struct SendMessageHandler {
    workspaces: HashSet<String>,
    outbox: mpsc::UnboundedSender<OutboundMessage>,
}

impl SendMessageHandler {
    pub fn new(workspaces: HashSet<String>, outbox: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { workspaces, outbox }
    }
}

#[async_trait]
impl IpcHandler for SendMessageHandler {
    fn description(&self) -> &str {
        "Send a message to the workspace's channel"
    }

    async fn handle(&self, payload: Value, ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
        let payload: Payload = serde_json::from_value(payload)
            .map_err(|e| IpcError::ProtocolViolation(format!("invalid send_message payload: {e}")))?;
        let from = &ctx.workspace.id;
        let to = payload.to.unwrap_or_else(|| from.clone());

        if &to != from && !ctx.workspace.admin {
            return Ok(HandlerReply::Decision {
                decision: Decision::Deny,
                reason: format!("workspace `{from}` may only message itself"),
            });
        }
        if !self.workspaces.contains(&to) {
            return Ok(HandlerReply::Decision {
                decision: Decision::Deny,
                reason: format!("unknown workspace `{to}`"),
            });
        }

        info!(session = %ctx.session_id, "Message from {from} to {to} ({} chars)", payload.text.len());
        self.outbox
            .send(OutboundMessage {
                from_workspace: from.clone(),
                to_workspace: to.clone(),
                session_id: ctx.session_id.clone(),
                text: payload.text,
            })
            .map_err(|_| IpcError::Handler("outbound channel closed".into()))?;

        Ok(HandlerReply::Result(json!({ "delivered": true, "to": to })))
    }
}
