//! Newline-delimited JSON records exchanged with a sandbox over stdio.
//!
//! Every record carries a `type` discriminator. Host → sandbox records are
//! [`InboundRecord`]s; everything the sandbox prints on stdout is decoded
//! into a [`SessionEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::IpcResponse;

/// Records written to the sandbox's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundRecord {
    /// One job for the agent to work on.
    Prompt { job_id: String, text: String },
    /// Asks the sandbox to finish and exit.
    Close,
    /// Answer to an in-band `ipc_request`.
    IpcResponse(IpcResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Structured output of a sandbox, in the order it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Text {
        text: String,
    },
    /// Turn marker: the agent finished the current job.
    Result {
        status: ResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    IpcRequest {
        request_id: String,
        request_type: String,
        #[serde(default)]
        payload: Value,
    },
    /// Produced by the host when a request has been answered.
    IpcResponse {
        response: IpcResponse,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Thinking { .. } => "thinking",
            SessionEvent::ToolUse { .. } => "tool_use",
            SessionEvent::ToolResult { .. } => "tool_result",
            SessionEvent::Text { .. } => "text",
            SessionEvent::Result { .. } => "result",
            SessionEvent::IpcRequest { .. } => "ipc_request",
            SessionEvent::IpcResponse { .. } => "ipc_response",
        }
    }
}

/// Serializes a record as a single line, newline included.
pub fn encode_line(record: &InboundRecord) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one stdout line. Blank lines yield `Ok(None)`. Responses are
/// only ever produced by the host, so a sandbox printing one is refused.
pub fn decode_line(line: &str) -> serde_json::Result<Option<SessionEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<SessionEvent>(trimmed)? {
        SessionEvent::IpcResponse { .. } => Err(serde::de::Error::custom(
            "ipc_response records are host-only",
        )),
        event => Ok(Some(event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Decision;
    use serde_json::json;

    #[test]
    fn test_encode_prompt() {
        let line = encode_line(&InboundRecord::Prompt {
            job_id: "j1".to_string(),
            text: "hello".to_string(),
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"prompt\",\"job_id\":\"j1\",\"text\":\"hello\"}\n");
    }

    #[test]
    fn test_encode_close() {
        assert_eq!(encode_line(&InboundRecord::Close).unwrap(), "{\"type\":\"close\"}\n");
    }

    #[test]
    fn test_encode_ipc_response_is_flat() {
        let line = encode_line(&InboundRecord::IpcResponse(IpcResponse::decision(
            "r1",
            Decision::Deny,
            "blocked",
        )))
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "ipc_response");
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["decision"], "deny");
        assert_eq!(value["reason"], "blocked");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_decode_all_outbound_types() {
        let lines = [
            r#"{"type":"thinking","text":"planning"}"#,
            r#"{"type":"tool_use","id":"t1","name":"bash","input":{"command":"ls"}}"#,
            r#"{"type":"tool_result","tool_use_id":"t1","content":"a.txt"}"#,
            r#"{"type":"text","text":"done"}"#,
            r#"{"type":"result","status":"success"}"#,
            r#"{"type":"ipc_request","request_id":"r1","request_type":"exec_check","payload":{"command":"ls"}}"#,
        ];
        let kinds: Vec<&str> = lines
            .iter()
            .map(|l| decode_line(l).unwrap().unwrap().kind())
            .collect();
        assert_eq!(
            kinds,
            vec!["thinking", "tool_use", "tool_result", "text", "result", "ipc_request"]
        );
    }

    #[test]
    fn test_decode_tool_result_defaults() {
        let event = decode_line(r#"{"type":"tool_result","tool_use_id":"t9"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SessionEvent::ToolResult {
                tool_use_id: "t9".to_string(),
                name: None,
                content: Value::Null,
                is_error: false,
            }
        );
    }

    #[test]
    fn test_decode_result() {
        let event = decode_line(r#"{"type":"result","status":"error","text":"boom"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SessionEvent::Result {
                status: ResultStatus::Error,
                text: Some("boom".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_blank_and_garbage() {
        assert!(decode_line("   ").unwrap().is_none());
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"type":"unknown"}"#).is_err());
        assert!(decode_line(r#"{"text":"missing type"}"#).is_err());
    }

    #[test]
    fn test_session_event_serializes_with_type() {
        let value = serde_json::to_value(SessionEvent::ToolUse {
            id: "t1".to_string(),
            name: "bash".to_string(),
            input: json!({"command": "pwd"}),
        })
        .unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["input"]["command"], "pwd");
    }

    #[test]
    fn test_sandbox_cannot_forge_ipc_response() {
        let line = r#"{"type":"ipc_response","response":{"request_id":"r1","decision":"allow"}}"#;
        let err = decode_line(line).unwrap_err();
        assert!(err.to_string().contains("host-only"));
    }
}
