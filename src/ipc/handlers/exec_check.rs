use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ipc::{HandlerReply, IpcError, IpcHandler, RequestContext};
use crate::security::SecurityGate;

pub const REQUEST_TYPE: &str = "exec_check";

/// Asks the security gate whether the sandbox may run a shell command.
///
/// Payload: `{"command": "<shell command line>"}`. The reply is an
/// allow/deny decision with a reason; the call blocks while an approval
/// is pending.
pub struct ExecCheckHandler {
    gate: Arc<SecurityGate>,
}

impl ExecCheckHandler {
    pub fn new(gate: Arc<SecurityGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl IpcHandler for ExecCheckHandler {
    fn description(&self) -> &str {
        "Decide whether a shell command may run (taint cascade, approvals)"
    }

    async fn handle(&self, payload: Value, ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| IpcError::ProtocolViolation("missing string field `command`".into()))?;

        let decision = self.gate.evaluate(ctx, command).await;
        Ok(HandlerReply::Decision {
            decision: decision.decision,
            reason: decision.reason,
        })
    }

    async fn session_closed(&self, session_id: &str) {
        self.gate.approvals().cancel_session(session_id).await;
    }
}
