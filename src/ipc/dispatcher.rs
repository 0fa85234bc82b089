use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{HandlerReply, IpcError, IpcHandler, IpcRequest, IpcResponse, RequestContext};

/// Routes IPC requests to the handler registered for their type.
///
/// `dispatch` never fails: unknown types, handler errors and handler
/// panics all become `{error: ...}` responses, so a misbehaving handler
/// only fails the one request.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn IpcHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler. A later registration for the same type wins.
    pub fn register_handler(&mut self, request_type: impl Into<String>, handler: Arc<dyn IpcHandler>) {
        let request_type = request_type.into();
        if self.handlers.insert(request_type.clone(), handler).is_some() {
            warn!("IPC handler for `{request_type}` replaced");
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Registered request types with their descriptions, sorted by type.
    pub fn handler_summaries(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .handlers
            .iter()
            .map(|(t, h)| (t.clone(), h.description().to_string()))
            .collect();
        out.sort();
        out
    }

    pub async fn dispatch(&self, ctx: &RequestContext, request: IpcRequest) -> IpcResponse {
        let IpcRequest {
            request_id,
            request_type,
            payload,
        } = request;

        let Some(handler) = self.handlers.get(&request_type) else {
            warn!(
                session = %ctx.session_id,
                "IPC request {request_id} has unknown type `{request_type}`"
            );
            return IpcResponse::from_error(request_id, &IpcError::HandlerNotFound(request_type));
        };

        debug!(session = %ctx.session_id, "Dispatching IPC request {request_id} ({request_type})");

        let outcome = AssertUnwindSafe(handler.handle(payload, ctx))
            .catch_unwind()
            .await
            .unwrap_or(Err(IpcError::HandlerPanicked));

        match outcome {
            Ok(HandlerReply::Decision { decision, reason }) => {
                IpcResponse::decision(request_id, decision, reason)
            }
            Ok(HandlerReply::Result(value)) => IpcResponse::result(request_id, value),
            Err(e) => {
                error!(
                    session = %ctx.session_id,
                    "IPC handler `{request_type}` failed for {request_id}: {e}"
                );
                IpcResponse::from_error(request_id, &e)
            }
        }
    }

    /// Notifies every handler that a session ended.
    pub async fn session_closed(&self, session_id: &str) {
        for handler in self.handlers.values() {
            handler.session_closed(session_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Decision;
    use crate::security::TaintCell;
    use crate::test_support::workspace;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait]
    impl IpcHandler for Echo {
        fn description(&self) -> &str {
            "echoes the payload"
        }

        async fn handle(&self, payload: Value, _ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
            Ok(HandlerReply::Result(payload))
        }
    }

    struct Failing;

    #[async_trait]
    impl IpcHandler for Failing {
        fn description(&self) -> &str {
            "always fails"
        }

        async fn handle(&self, _payload: Value, _ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
            Err(anyhow::anyhow!("disk on fire").into())
        }
    }

    struct Panicking;

    #[async_trait]
    impl IpcHandler for Panicking {
        fn description(&self) -> &str {
            "panics"
        }

        async fn handle(&self, _payload: Value, _ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
            panic!("handler bug");
        }
    }

    struct Gatekeeper {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl IpcHandler for Gatekeeper {
        fn description(&self) -> &str {
            "denies everything"
        }

        async fn handle(&self, payload: Value, _ctx: &RequestContext) -> Result<HandlerReply, IpcError> {
            if payload.get("command").is_none() {
                return Err(IpcError::ProtocolViolation("missing `command`".into()));
            }
            Ok(HandlerReply::Decision {
                decision: Decision::Deny,
                reason: "nope".into(),
            })
        }

        async fn session_closed(&self, _session_id: &str) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            session_id: "s1".to_string(),
            workspace: Arc::new(workspace("main")),
            taint: Arc::new(TaintCell::new()),
        }
    }

    fn request(id: &str, request_type: &str, payload: Value) -> IpcRequest {
        IpcRequest {
            request_id: id.to_string(),
            request_type: request_type.to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler("echo", Arc::new(Echo));

        let resp = dispatcher
            .dispatch(&ctx(), request("r1", "echo", json!({"x": 1})))
            .await;
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.result, Some(json!({"x": 1})));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_type_is_handler_not_found() {
        let dispatcher = Dispatcher::new();
        let resp = dispatcher.dispatch(&ctx(), request("r1", "launch_missiles", json!({}))).await;
        assert_eq!(resp.request_id, "r1");
        let error = resp.error.unwrap();
        assert_eq!(error.kind, "handler_not_found");
        assert!(error.message.contains("launch_missiles"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_response() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler("fail", Arc::new(Failing));

        let resp = dispatcher.dispatch(&ctx(), request("r7", "fail", Value::Null)).await;
        assert_eq!(resp.request_id, "r7");
        let error = resp.error.unwrap();
        assert_eq!(error.kind, "handler_error");
        assert!(error.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler("panic", Arc::new(Panicking));
        dispatcher.register_handler("echo", Arc::new(Echo));

        let resp = dispatcher.dispatch(&ctx(), request("r1", "panic", Value::Null)).await;
        assert_eq!(resp.error.unwrap().kind, "handler_panicked");

        // The dispatcher is still usable afterwards
        let resp = dispatcher.dispatch(&ctx(), request("r2", "echo", json!(2))).await;
        assert_eq!(resp.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_protocol_violation_denies_request() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler(
            "exec_check",
            Arc::new(Gatekeeper {
                closed: AtomicUsize::new(0),
            }),
        );

        let resp = dispatcher.dispatch(&ctx(), request("r1", "exec_check", json!({}))).await;
        assert_eq!(resp.decision, Some(Decision::Deny));
        assert_eq!(resp.error.unwrap().kind, "protocol_violation");
    }

    #[tokio::test]
    async fn test_session_closed_reaches_every_handler() {
        let keeper = Arc::new(Gatekeeper {
            closed: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler("a", keeper.clone());
        dispatcher.register_handler("b", Arc::new(Echo));

        dispatcher.session_closed("s1").await;
        assert_eq!(keeper.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_summaries_sorted() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_handler("zeta", Arc::new(Echo));
        dispatcher.register_handler("alpha", Arc::new(Failing));
        let summaries = dispatcher.handler_summaries();
        assert_eq!(summaries[0].0, "alpha");
        assert_eq!(summaries[1].0, "zeta");
        assert_eq!(dispatcher.len(), 2);
    }
}
