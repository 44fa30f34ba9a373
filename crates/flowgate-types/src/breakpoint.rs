//! Breakpoint (human approval) types.
//!
//! A `BreakpointConfig` annotates a node in the graph. When the scheduler
//! reaches that node it creates a `BreakpointRequest`, suspends the run and
//! hands the request to external approvers. The request is mutated only
//! through the approval API and archived once resolved.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Node-level breakpoint annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakpointConfig {
    /// Human-readable prompt shown to approvers.
    #[serde(default)]
    pub prompt: String,
    /// Approvers allowed to decide. Empty means anyone may decide.
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub mode: ApprovalMode,
    /// Seconds until the request expires (no deadline when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    /// Node activated (with the breakpoint node's inputs) on rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<String>,
    /// What happens when the deadline elapses without a decision.
    #[serde(default)]
    pub on_expire: ExpiryAction,
    /// Custom fields approvers are expected to fill in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

/// How many approvers must approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// The first approval resolves the request.
    #[default]
    Any,
    /// Every listed approver must approve.
    All,
}

/// Resolution applied when a request expires.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpiryAction {
    /// Treat expiry as a rejection.
    #[default]
    Reject,
    /// Divert the run to a fallback node.
    Escalate { node: String },
}

/// Lifecycle status of a breakpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl BreakpointStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, BreakpointStatus::Pending)
    }
}

/// Approve or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// One approver's decision, as submitted through the approval API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub approver: String,
    pub verdict: Verdict,
    /// Custom fields merged into the node's parameters on approval.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Decision {
    pub fn approve(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            verdict: Verdict::Approve,
            fields: BTreeMap::new(),
            comment: None,
        }
    }

    pub fn reject(approver: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            ..Self::approve(approver)
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A recorded vote on a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalVote {
    pub decision: Decision,
    pub decided_at: DateTime<Utc>,
}

/// A pending or resolved human decision gating a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    /// UUIDv7 request ID.
    pub id: Uuid,
    pub run_id: Uuid,
    /// Node gated by this request.
    pub node_id: String,
    pub prompt: String,
    pub approvers: Vec<String>,
    pub mode: ApprovalMode,
    pub status: BreakpointStatus,
    /// Votes collected so far, in arrival order.
    #[serde(default)]
    pub votes: Vec<ApprovalVote>,
    /// Custom fields collected from approving votes (later votes win).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<String>,
    #[serde(default)]
    pub on_expire: ExpiryAction,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BreakpointRequest {
    /// Whether `approver` may vote on this request.
    pub fn accepts(&self, approver: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == approver)
    }

    /// Approvers who have not yet voted.
    pub fn outstanding_approvers(&self) -> Vec<&str> {
        self.approvers
            .iter()
            .filter(|a| !self.votes.iter().any(|v| &v.decision.approver == *a))
            .map(String::as_str)
            .collect()
    }

    /// Whether the deadline has elapsed at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == BreakpointStatus::Pending && self.deadline.is_some_and(|d| d <= now)
    }
}
