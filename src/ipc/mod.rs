pub mod channel;
pub mod dispatcher;
pub mod handlers;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::Workspace;
use crate::security::TaintCell;

/// A privileged action requested by a running sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Unique within the owning session
    pub request_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// The answer to one [`IpcRequest`], correlated solely by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IpcResponse {
    pub fn decision(request_id: impl Into<String>, decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            decision: Some(decision),
            result: None,
            error: None,
            reason: Some(reason.into()),
        }
    }

    pub fn result(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            decision: None,
            result: Some(result),
            error: None,
            reason: None,
        }
    }

    /// Converts a failed dispatch into a response. Protocol violations
    /// also carry an explicit deny so the sandbox cannot read the absence
    /// of a decision as permission.
    pub fn from_error(request_id: impl Into<String>, err: &IpcError) -> Self {
        let message = err.to_string();
        let decision = match err {
            IpcError::ProtocolViolation(_) => Some(Decision::Deny),
            _ => None,
        };
        Self {
            request_id: request_id.into(),
            decision,
            result: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: message.clone(),
            }),
            reason: Some(message),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum IpcError {
    #[error("no handler registered for request type `{0}`")]
    HandlerNotFound(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("handler panicked while processing the request")]
    HandlerPanicked,
}

impl IpcError {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcError::HandlerNotFound(_) => "handler_not_found",
            IpcError::ProtocolViolation(_) => "protocol_violation",
            IpcError::Handler(_) => "handler_error",
            IpcError::HandlerPanicked => "handler_panicked",
        }
    }
}

impl From<anyhow::Error> for IpcError {
    fn from(e: anyhow::Error) -> Self {
        IpcError::Handler(e.to_string())
    }
}

/// Session-scoped context handed to every handler invocation.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub workspace: Arc<Workspace>,
    pub taint: Arc<TaintCell>,
}

/// What a handler produced for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    Decision { decision: Decision, reason: String },
    Result(Value),
}

/// A host-side capability a sandbox can invoke over IPC.
///
/// Handlers are registered on the [`dispatcher::Dispatcher`] under a
/// request type. A handler may block (for example on human approval);
/// the session keeps streaming while it does.
#[async_trait]
pub trait IpcHandler: Send + Sync {
    /// Human-readable description for status output.
    fn description(&self) -> &str;

    async fn handle(&self, payload: Value, ctx: &RequestContext) -> Result<HandlerReply, IpcError>;

    /// Called once when a session ends, whatever the reason.
    async fn session_closed(&self, _session_id: &str) {}
}
