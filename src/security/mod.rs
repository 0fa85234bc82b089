//! Risk gating for commands a sandbox wants to execute.
//!
//! Each request runs through a cascade and stops at the first tier that
//! resolves it:
//!
//! 1. untainted session: allow
//! 2. every simple command is provably local: allow
//! 3. a network-capable pattern in a session with both taints: approval
//! 4. the injected [`RiskClassifier`] decides, taking the taint into account
//!
//! Commands that cannot be parsed are denied before the cascade starts.

pub mod approval;
pub mod classifier;
pub mod command;
pub mod taint;

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

pub use approval::{ApprovalBroker, ApprovalError, ApprovalRequest, ApprovalStatus};
pub use classifier::{ClassifierContext, KeywordClassifier, LlmRiskClassifier, RiskClassifier};
pub use command::ParsedCommand;
pub use taint::{TaintCell, TaintRules, TaintState};

use crate::ipc::{Decision, RequestContext};
use crate::observe::{EventSink, ObservedEvent};

/// Outcome of the cascade, before any approval is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Parse,
    Taint,
    LocalAllowlist,
    NetworkDenylist,
    Classifier,
}

impl Tier {
    pub fn number(&self) -> u8 {
        match self {
            Tier::Parse => 0,
            Tier::Taint => 1,
            Tier::LocalAllowlist => 2,
            Tier::NetworkDenylist => 3,
            Tier::Classifier => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub tier: Tier,
    pub reason: String,
}

impl Assessment {
    fn new(verdict: Verdict, tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            tier,
            reason: reason.into(),
        }
    }
}

/// A decision as reported to the observability sink.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub session_id: String,
    pub workspace_id: String,
    pub command: String,
    pub verdict: Verdict,
    pub tier: Tier,
    /// What the sandbox is told
    pub decision: Decision,
    pub reason: String,
    pub taint: TaintState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
}

pub struct SecurityGate {
    classifier: Arc<dyn RiskClassifier>,
    approvals: Arc<ApprovalBroker>,
    sink: Arc<dyn EventSink>,
}

impl SecurityGate {
    pub fn new(
        classifier: Arc<dyn RiskClassifier>,
        approvals: Arc<ApprovalBroker>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            classifier,
            approvals,
            sink,
        }
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn classifier_name(&self) -> String {
        self.classifier.name()
    }

    /// Runs the cascade for one command.
    pub async fn assess(&self, command: &str, taint: TaintState, workspace_id: &str) -> Assessment {
        let parsed = match ParsedCommand::parse(command) {
            Ok(parsed) => parsed,
            Err(e) => return Assessment::new(Verdict::Deny, Tier::Parse, format!("refused: {e}")),
        };

        if taint.is_clean() {
            return Assessment::new(Verdict::Allow, Tier::Taint, "session is untainted");
        }

        if parsed.is_provably_local() {
            return Assessment::new(
                Verdict::Allow,
                Tier::LocalAllowlist,
                "only local-only commands",
            );
        }

        let pattern = parsed.network_pattern();
        if let Some(pattern) = &pattern {
            if taint.is_dual() {
                return Assessment::new(
                    Verdict::Approval,
                    Tier::NetworkDenylist,
                    format!("{pattern} in a session holding untrusted input and sensitive data"),
                );
            }
        }

        let ctx = ClassifierContext {
            workspace_id: workspace_id.to_string(),
            taint,
            matched_pattern: pattern,
        };
        let flagged = match self.classifier.classify(command, &ctx).await {
            Ok(flagged) => flagged,
            Err(e) => {
                warn!("Classifier {} failed, treating `{command}` as flagged: {e}", self.classifier.name());
                true
            }
        };

        match (flagged, taint.is_dual()) {
            (false, _) => Assessment::new(
                Verdict::Allow,
                Tier::Classifier,
                "classifier found no exfiltration risk",
            ),
            (true, true) => Assessment::new(
                Verdict::Approval,
                Tier::Classifier,
                "classifier flagged the command in a session holding untrusted input and sensitive data",
            ),
            (true, false) => Assessment::new(
                Verdict::Deny,
                Tier::Classifier,
                format!("classifier flagged the command in a session tainted with {taint}"),
            ),
        }
    }

    /// Assesses a command for a session, collects approval when needed and
    /// reports the decision. Never adds taint.
    pub async fn evaluate(&self, ctx: &RequestContext, command: &str) -> GateDecision {
        let taint = ctx.taint.get();
        let assessment = self.assess(command, taint, &ctx.workspace.id).await;

        let (decision, reason, approval) = match assessment.verdict {
            Verdict::Allow => (Decision::Allow, assessment.reason, None),
            Verdict::Deny => (Decision::Deny, assessment.reason, None),
            Verdict::Approval => {
                let request = self
                    .approvals
                    .request(&ctx.session_id, &ctx.workspace.id, command, &assessment.reason)
                    .await;
                let (decision, reason) = match request.status {
                    ApprovalStatus::Approved => (
                        Decision::Allow,
                        format!("approved by operator ({})", assessment.reason),
                    ),
                    ApprovalStatus::Expired => (
                        Decision::Deny,
                        format!(
                            "approval timed out after {}s without an answer ({})",
                            self.approvals.timeout().as_secs(),
                            assessment.reason
                        ),
                    ),
                    ApprovalStatus::Denied | ApprovalStatus::Pending => (
                        Decision::Deny,
                        format!("denied by operator or session end ({})", assessment.reason),
                    ),
                };
                (decision, reason, Some(request))
            }
        };

        let gate_decision = GateDecision {
            session_id: ctx.session_id.clone(),
            workspace_id: ctx.workspace.id.clone(),
            command: command.to_string(),
            verdict: assessment.verdict,
            tier: assessment.tier,
            decision,
            reason,
            taint,
            approval,
        };
        self.sink.emit(&ObservedEvent::Decision(gate_decision.clone()));
        gate_decision
    }
}
