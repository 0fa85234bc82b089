use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ipc::{HandlerReply, IpcError, IpcHandler, RequestContext};
use crate::security::TaintState;

pub const REQUEST_TYPE: &str = "taint";

/// Lets the sandbox report that it consumed untrusted input or touched
/// sensitive data. Flags can only be added.
pub struct TaintReportHandler;

#[async_trait]
impl IpcHandler for TaintReportHandler {
    fn description(&self) -> &str {
        "Record untrusted input or sensitive data seen by the session"
    }

    async fn handle(&self, payload: Value, ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
        if !payload.is_object() {
            return Err(IpcError::ProtocolViolation(
                "taint payload must be an object".into(),
            ));
        }
        let flags: TaintState = serde_json::from_value(payload)
            .map_err(|e| IpcError::ProtocolViolation(format!("invalid taint payload: {e}")))?;
        let state = ctx.taint.mark(flags);
        Ok(HandlerReply::Result(json!({ "taint": state })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::TaintCell;
    use crate::test_support::workspace;
    use std::sync::Arc;

    fn ctx() -> RequestContext {
        RequestContext {
            session_id: "s1".to_string(),
            workspace: Arc::new(workspace("main")),
            taint: Arc::new(TaintCell::new()),
        }
    }

    #[tokio::test]
    async fn test_flags_accumulate() {
        let ctx = ctx();
        TaintReportHandler
            .handle(json!({"corruption": true}), &ctx)
            .await
            .unwrap();
        let reply = TaintReportHandler
            .handle(json!({"secret": true, "corruption": false}), &ctx)
            .await
            .unwrap();

        assert!(ctx.taint.get().is_dual());
        assert_eq!(
            reply,
            HandlerReply::Result(json!({"taint": {"corruption": true, "secret": true}}))
        );
    }

    #[tokio::test]
    async fn test_bad_payload_rejected() {
        let ctx = ctx();
        for payload in [Value::Null, json!("secret"), json!({"secret": "yes"})] {
            let err = TaintReportHandler.handle(payload, &ctx).await.unwrap_err();
            assert!(matches!(err, IpcError::ProtocolViolation(_)));
        }
        assert!(ctx.taint.get().is_clean());
    }
}
