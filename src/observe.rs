//! Observability sink for session output, lifecycle changes, gate
//! decisions and job outcomes.
//!
//! Events are handed to the sink as they happen. The host never keeps
//! them; a [`JsonlSink`] can append them to an audit file, one JSON
//! object per line.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::ipc::Decision;
use crate::queue::JobStatus;
use crate::sandbox::protocol::SessionEvent;
use crate::sandbox::SessionState;
use crate::security::GateDecision;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservedEvent {
    /// One record read from a sandbox
    Session {
        session_id: String,
        workspace_id: String,
        event: SessionEvent,
    },
    Lifecycle {
        session_id: String,
        workspace_id: String,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Decision(GateDecision),
    Job {
        job_id: String,
        workspace_id: String,
        status: JobStatus,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ObservedEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ObservedEvent) {
        match event {
            ObservedEvent::Session {
                session_id, event, ..
            } => match event {
                SessionEvent::ToolUse { name, .. } => {
                    info!(session = %session_id, tool = %name, "Tool call")
                }
                SessionEvent::Result { status, .. } => {
                    info!(session = %session_id, "Turn finished ({status:?})")
                }
                other => debug!(session = %session_id, kind = other.kind(), "Session event"),
            },
            ObservedEvent::Lifecycle {
                session_id,
                workspace_id,
                state,
                detail,
            } => info!(
                session = %session_id,
                workspace = %workspace_id,
                "Session {state}{}",
                detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
            ),
            ObservedEvent::Decision(d) if d.decision == Decision::Deny => warn!(
                session = %d.session_id,
                tier = d.tier.number(),
                "Denied `{}`: {}",
                d.command,
                d.reason
            ),
            ObservedEvent::Decision(d) => info!(
                session = %d.session_id,
                tier = d.tier.number(),
                "Allowed `{}`: {}",
                d.command,
                d.reason
            ),
            ObservedEvent::Job {
                job_id,
                workspace_id,
                status,
                attempt,
                detail,
            } => {
                let detail = detail.as_deref().unwrap_or("");
                if *status == JobStatus::Failed {
                    warn!(workspace = %workspace_id, "Job {job_id} failed after {attempt} attempt(s) {detail}");
                } else {
                    info!(workspace = %workspace_id, "Job {job_id} {status:?} (attempt {attempt}) {detail}");
                }
            }
        }
    }
}

/// Appends events to a JSONL file with an RFC 3339 `ts` field.
pub struct JsonlSink {
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Audit log opened at {}", path.display());
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, event: &ObservedEvent) -> Result<()> {
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(map) = &mut value {
            map.insert("ts".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
        }
        let line = serde_json::to_string(&value)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &ObservedEvent) {
        if let Err(e) = self.write(event) {
            warn!("Failed to write audit record: {e}");
        }
    }
}

/// Forwards each event to every inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &ObservedEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Keeps every event in memory for assertions.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ObservedEvent>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn decisions(&self) -> Vec<GateDecision> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Decision(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn session_events(&self) -> Vec<SessionEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Session { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn lifecycle(&self) -> Vec<SessionState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Lifecycle { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn jobs(&self) -> Vec<(String, JobStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObservedEvent::Job { job_id, status, .. } => Some((job_id, status)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn emit(&self, event: &ObservedEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::protocol::ResultStatus;

    fn text_event() -> ObservedEvent {
        ObservedEvent::Session {
            session_id: "s1".to_string(),
            workspace_id: "main".to_string(),
            event: SessionEvent::Text {
                text: "hello".to_string(),
            },
        }
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/events.jsonl");
        let sink = JsonlSink::open(&path).unwrap();

        sink.emit(&text_event());
        sink.emit(&ObservedEvent::Lifecycle {
            session_id: "s1".to_string(),
            workspace_id: "main".to_string(),
            state: SessionState::Stopped,
            detail: None,
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "session");
        assert_eq!(lines[0]["event"]["type"], "text");
        assert!(lines[0]["ts"].is_string());
        assert_eq!(lines[1]["kind"], "lifecycle");
        assert_eq!(lines[1]["state"], "stopped");
        assert!(lines[1].get("detail").is_none());
    }

    #[test]
    fn test_jsonl_sink_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        JsonlSink::open(&path).unwrap().emit(&text_event());
        JsonlSink::open(&path).unwrap().emit(&text_event());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::default());
        let b = Arc::new(MemorySink::default());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(TracingSink)]);

        fanout.emit(&text_event());
        fanout.emit(&ObservedEvent::Session {
            session_id: "s1".to_string(),
            workspace_id: "main".to_string(),
            event: SessionEvent::Result {
                status: ResultStatus::Success,
                text: None,
            },
        });
        assert_eq!(a.session_events().len(), 2);
        assert_eq!(b.session_events().len(), 2);
        assert!(matches!(b.session_events()[1], SessionEvent::Result { .. }));
    }

    #[test]
    fn test_job_event_serialization() {
        let value = serde_json::to_value(ObservedEvent::Job {
            job_id: "j1".to_string(),
            workspace_id: "main".to_string(),
            status: JobStatus::Retrying,
            attempt: 2,
            detail: Some("sandbox crashed".to_string()),
        })
        .unwrap();
        assert_eq!(value["kind"], "job");
        assert_eq!(value["status"], "retrying");
        assert_eq!(value["attempt"], 2);
    }
}
