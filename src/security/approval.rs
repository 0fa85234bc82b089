//! Human approval for commands the gate escalates.
//!
//! A pending request blocks its dispatch until an operator resolves it,
//! the session ends, or it expires. Only an explicit approval allows the
//! command; every other outcome is a deny.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub workspace_id: String,
    pub command: String,
    /// Why the gate escalated
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

#[derive(Debug, Error, PartialEq)]
pub enum ApprovalError {
    #[error("no pending approval request `{0}`")]
    NotFound(String),
}

struct Pending {
    request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalStatus>,
}

pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, Pending>>,
    timeout: Duration,
    notifier: Option<mpsc::UnboundedSender<ApprovalRequest>>,
}

impl ApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            notifier: None,
        }
    }

    /// Publishes every new request on `notifier`, the approval channel.
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<ApprovalRequest>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Creates a request and waits for its resolution. Returns the final
    /// request; its status is never `Pending`.
    pub async fn request(
        &self,
        session_id: &str,
        workspace_id: &str,
        command: &str,
        reason: &str,
    ) -> ApprovalRequest {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            workspace_id: workspace_id.to_string(),
            command: command.to_string(),
            reason: reason.to_string(),
            created_at,
            expires_at,
            status: ApprovalStatus::Pending,
        };

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request.id.clone(),
            Pending {
                request: request.clone(),
                reply: tx,
            },
        );
        info!(
            session = %session_id,
            "Approval {} requested for `{command}` (expires {})",
            request.id,
            expires_at.to_rfc3339()
        );
        if let Some(notifier) = &self.notifier {
            if notifier.send(request.clone()).is_err() {
                warn!("Approval channel closed, request {} can only expire", request.id);
            }
        }

        let status = tokio::select! {
            resolved = &mut rx => resolved.unwrap_or(ApprovalStatus::Denied),
            _ = tokio::time::sleep(self.timeout) => {
                // A resolution may have raced the timer
                if self.pending.lock().await.remove(&request.id).is_some() {
                    warn!(session = %session_id, "Approval {} expired", request.id);
                    ApprovalStatus::Expired
                } else {
                    rx.try_recv().unwrap_or(ApprovalStatus::Denied)
                }
            }
        };

        ApprovalRequest { status, ..request }
    }

    /// Resolves a pending request on behalf of the operator.
    pub async fn resolve(&self, id: &str, approve: bool) -> Result<ApprovalRequest, ApprovalError> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        // The waiter may already be gone if its session was killed
        let _ = entry.reply.send(status);
        info!("Approval {id} resolved: {status}");
        Ok(ApprovalRequest {
            status,
            ..entry.request
        })
    }

    /// Denies every pending request of a session. Returns how many.
    pub async fn cancel_session(&self, session_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.request.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.reply.send(ApprovalStatus::Denied);
            }
        }
        if !ids.is_empty() {
            info!(session = %session_id, "Denied {} pending approval(s) on session end", ids.len());
        }
        ids.len()
    }

    /// Snapshot of unresolved requests, oldest first.
    pub async fn pending(&self) -> Vec<ApprovalRequest> {
        let mut out: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn wait_for_pending(broker: &ApprovalBroker) -> ApprovalRequest {
        for _ in 0..200 {
            if let Some(req) = broker.pending().await.into_iter().next() {
                return req;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no approval request appeared");
    }

    #[tokio::test]
    async fn test_unanswered_request_expires_to_deny() {
        let broker = ApprovalBroker::new(Duration::from_millis(50));
        let result = broker.request("s1", "main", "curl x", "dual taint").await;
        assert_eq!(result.status, ApprovalStatus::Expired);
        assert!(result.expires_at > result.created_at);
        assert!(broker.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_operator_approval() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(5)));
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("s1", "main", "curl x", "r").await })
        };

        let pending = wait_for_pending(&broker).await;
        assert_eq!(pending.status, ApprovalStatus::Pending);
        assert_eq!(pending.command, "curl x");

        let resolved = broker.resolve(&pending.id, true).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(waiter.await.unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_operator_denial_and_double_resolve() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(5)));
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("s1", "main", "wget y", "r").await })
        };
        let pending = wait_for_pending(&broker).await;

        broker.resolve(&pending.id, false).await.unwrap();
        assert_eq!(waiter.await.unwrap().status, ApprovalStatus::Denied);
        assert_eq!(
            broker.resolve(&pending.id, true).await,
            Err(ApprovalError::NotFound(pending.id.clone()))
        );
    }

    #[tokio::test]
    async fn test_cancel_session_denies_only_that_session() {
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(5)));
        let a = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("s1", "main", "curl a", "r").await })
        };
        let b = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("s2", "other", "curl b", "r").await })
        };
        for _ in 0..200 {
            if broker.pending().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(broker.cancel_session("s1").await, 1);
        assert_eq!(a.await.unwrap().status, ApprovalStatus::Denied);

        let remaining = broker.pending().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "s2");
        broker.resolve(&remaining[0].id, true).await.unwrap();
        assert_eq!(b.await.unwrap().status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_notifier_receives_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = Arc::new(ApprovalBroker::new(Duration::from_secs(5)).with_notifier(tx));
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("s1", "main", "npm i", "r").await })
        };

        let published = rx.recv().await.unwrap();
        assert_eq!(published.command, "npm i");
        broker.resolve(&published.id, false).await.unwrap();
        assert_eq!(waiter.await.unwrap().status, ApprovalStatus::Denied);
    }
}
