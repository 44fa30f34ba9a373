//! Breakpoint gate: the approval state machine.
//!
//! `None -> Pending -> {Approved, Rejected, Expired}`. The gate is stateless;
//! it opens requests for annotated nodes, applies votes and expiry to a
//! request, and tells the engine how a resolved request continues the run.
//! Persistence (with sequence-number compare-and-swap) is the engine's job.

use chrono::{DateTime, Duration, Utc};
use flowgate_types::breakpoint::{
    ApprovalMode, ApprovalVote, BreakpointConfig, BreakpointRequest, BreakpointStatus, Decision,
    ExpiryAction, Verdict,
};
use flowgate_types::error::RepositoryError;
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the approval API.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("breakpoint request not found: {0}")]
    NotFound(Uuid),

    #[error("breakpoint request {id} is already {status:?}")]
    NotPending { id: Uuid, status: BreakpointStatus },

    #[error("'{approver}' may not decide request {id}")]
    NotApprover { id: Uuid, approver: String },

    #[error("'{approver}' already voted on request {id}")]
    AlreadyVoted { id: Uuid, approver: String },

    #[error("request {id} is not overdue")]
    NotOverdue { id: Uuid },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// How a resolved request continues the run.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResolution {
    /// Run the gated node with these fields merged into its parameters.
    Approved(Map<String, Value>),
    /// Skip the gated node and activate `target` with its inputs.
    Divert { target: String },
    /// Fail the run with `BreakpointRejected`.
    Reject { reason: String },
}

// ---------------------------------------------------------------------------
// BreakpointGate
// ---------------------------------------------------------------------------

/// Stateless approval state machine.
pub struct BreakpointGate;

impl BreakpointGate {
    /// Open a pending request for `node_id`.
    pub fn open(
        run_id: Uuid,
        node_id: &str,
        config: &BreakpointConfig,
        default_deadline_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> BreakpointRequest {
        let deadline = config
            .deadline_secs
            .or(default_deadline_secs)
            .and_then(|secs| {
                let deadline = i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|d| now.checked_add_signed(d));
                if deadline.is_none() {
                    tracing::warn!(node_id, deadline_secs = secs, "breakpoint deadline out of range, waiting indefinitely");
                }
                deadline
            });
        BreakpointRequest {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.to_string(),
            prompt: config.prompt.clone(),
            approvers: config.approvers.clone(),
            mode: config.mode,
            status: BreakpointStatus::Pending,
            votes: Vec::new(),
            fields: Default::default(),
            on_reject: config.on_reject.clone(),
            on_expire: config.on_expire.clone(),
            created_at: now,
            deadline,
            resolved_at: None,
        }
    }

    /// Record one decision and return the resulting status.
    ///
    /// `any`: the first approval approves. `all`: every listed approver must
    /// approve. A rejection always rejects. A decision arriving after the
    /// deadline is dropped and the request expires instead.
    pub fn vote(
        request: &mut BreakpointRequest,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<BreakpointStatus, GateError> {
        if request.status != BreakpointStatus::Pending {
            return Err(GateError::NotPending {
                id: request.id,
                status: request.status,
            });
        }
        if !request.accepts(&decision.approver) {
            return Err(GateError::NotApprover {
                id: request.id,
                approver: decision.approver,
            });
        }
        if request.is_overdue(now) {
            request.status = BreakpointStatus::Expired;
            request.resolved_at = Some(now);
            return Ok(BreakpointStatus::Expired);
        }
        if request.votes.iter().any(|v| v.decision.approver == decision.approver) {
            return Err(GateError::AlreadyVoted {
                id: request.id,
                approver: decision.approver,
            });
        }

        let verdict = decision.verdict;
        if verdict == Verdict::Approve {
            request.fields.extend(decision.fields.clone());
        }
        request.votes.push(ApprovalVote {
            decision,
            decided_at: now,
        });

        let status = match (verdict, request.mode) {
            (Verdict::Reject, _) => BreakpointStatus::Rejected,
            (Verdict::Approve, ApprovalMode::Any) => BreakpointStatus::Approved,
            (Verdict::Approve, ApprovalMode::All) if request.outstanding_approvers().is_empty() => {
                BreakpointStatus::Approved
            }
            (Verdict::Approve, ApprovalMode::All) => BreakpointStatus::Pending,
        };
        if status.is_resolved() {
            request.status = status;
            request.resolved_at = Some(now);
        }
        Ok(status)
    }

    /// Mark an overdue request as expired.
    pub fn expire(request: &mut BreakpointRequest, now: DateTime<Utc>) -> Result<(), GateError> {
        if request.status != BreakpointStatus::Pending {
            return Err(GateError::NotPending {
                id: request.id,
                status: request.status,
            });
        }
        if !request.is_overdue(now) {
            return Err(GateError::NotOverdue { id: request.id });
        }
        request.status = BreakpointStatus::Expired;
        request.resolved_at = Some(now);
        Ok(())
    }

    /// How a resolved request continues the run (`None` while pending).
    pub fn resolution(request: &BreakpointRequest) -> Option<GateResolution> {
        let reject = |reason: String| match &request.on_reject {
            Some(target) => GateResolution::Divert {
                target: target.clone(),
            },
            None => GateResolution::Reject { reason },
        };
        match request.status {
            BreakpointStatus::Pending => None,
            BreakpointStatus::Approved => Some(GateResolution::Approved(
                request.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            BreakpointStatus::Rejected => {
                let by = request
                    .votes
                    .iter()
                    .rev()
                    .find(|v| v.decision.verdict == Verdict::Reject)
                    .map(|v| {
                        let comment = v.decision.comment.as_deref().unwrap_or("no comment");
                        format!("rejected by '{}': {comment}", v.decision.approver)
                    })
                    .unwrap_or_else(|| "rejected".to_string());
                Some(reject(by))
            }
            BreakpointStatus::Expired => Some(match &request.on_expire {
                ExpiryAction::Escalate { node } => GateResolution::Divert {
                    target: node.clone(),
                },
                ExpiryAction::Reject => reject("deadline elapsed without a decision".to_string()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(approvers: &[&str], mode: ApprovalMode) -> BreakpointConfig {
        BreakpointConfig {
            prompt: "deploy?".to_string(),
            approvers: approvers.iter().map(|s| s.to_string()).collect(),
            mode,
            ..BreakpointConfig::default()
        }
    }

    #[test]
    fn test_any_mode_first_approval_wins() {
        let now = Utc::now();
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&["a", "b"], ApprovalMode::Any), None, now);
        let status =
            BreakpointGate::vote(&mut req, Decision::approve("a").with_field("env", json!("prod")), now).unwrap();
        assert_eq!(status, BreakpointStatus::Approved);
        assert_eq!(req.resolved_at, Some(now));
        assert_eq!(
            BreakpointGate::resolution(&req),
            Some(GateResolution::Approved(
                [("env".to_string(), json!("prod"))].into_iter().collect()
            ))
        );
    }

    #[test]
    fn test_all_mode_waits_for_everyone() {
        let now = Utc::now();
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&["a", "b"], ApprovalMode::All), None, now);
        assert_eq!(
            BreakpointGate::vote(&mut req, Decision::approve("a"), now).unwrap(),
            BreakpointStatus::Pending
        );
        assert!(BreakpointGate::resolution(&req).is_none());
        assert!(matches!(
            BreakpointGate::vote(&mut req, Decision::approve("a"), now),
            Err(GateError::AlreadyVoted { .. })
        ));
        assert_eq!(
            BreakpointGate::vote(&mut req, Decision::approve("b"), now).unwrap(),
            BreakpointStatus::Approved
        );
    }

    #[test]
    fn test_any_rejection_rejects() {
        let now = Utc::now();
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&["a", "b"], ApprovalMode::All), None, now);
        BreakpointGate::vote(&mut req, Decision::approve("a"), now).unwrap();
        let status = BreakpointGate::vote(&mut req, Decision::reject("b").with_comment("not today"), now).unwrap();
        assert_eq!(status, BreakpointStatus::Rejected);
        match BreakpointGate::resolution(&req) {
            Some(GateResolution::Reject { reason }) => assert!(reason.contains("not today")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(matches!(
            BreakpointGate::vote(&mut req, Decision::approve("a"), now),
            Err(GateError::NotPending { .. })
        ));
    }

    #[test]
    fn test_unknown_approver_refused() {
        let now = Utc::now();
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&["a"], ApprovalMode::Any), None, now);
        assert!(matches!(
            BreakpointGate::vote(&mut req, Decision::approve("mallory"), now),
            Err(GateError::NotApprover { .. })
        ));
        assert!(req.votes.is_empty());
    }

    #[test]
    fn test_rejection_with_branch_diverts() {
        let now = Utc::now();
        let cfg = BreakpointConfig {
            on_reject: Some("notify".to_string()),
            ..config(&[], ApprovalMode::Any)
        };
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &cfg, None, now);
        BreakpointGate::vote(&mut req, Decision::reject("anyone"), now).unwrap();
        assert_eq!(
            BreakpointGate::resolution(&req),
            Some(GateResolution::Divert {
                target: "notify".to_string()
            })
        );
    }

    #[test]
    fn test_expiry_follows_configured_action() {
        let now = Utc::now();
        let cfg = BreakpointConfig {
            deadline_secs: Some(60),
            on_expire: ExpiryAction::Escalate {
                node: "page".to_string(),
            },
            ..config(&[], ApprovalMode::Any)
        };
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &cfg, None, now);
        assert!(matches!(
            BreakpointGate::expire(&mut req, now),
            Err(GateError::NotOverdue { .. })
        ));
        BreakpointGate::expire(&mut req, now + Duration::seconds(61)).unwrap();
        assert_eq!(req.status, BreakpointStatus::Expired);
        assert_eq!(
            BreakpointGate::resolution(&req),
            Some(GateResolution::Divert {
                target: "page".to_string()
            })
        );

        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&[], ApprovalMode::Any), Some(1), now);
        assert!(req.deadline.is_some());
        BreakpointGate::expire(&mut req, now + Duration::seconds(2)).unwrap();
        assert!(matches!(
            BreakpointGate::resolution(&req),
            Some(GateResolution::Reject { .. })
        ));
    }

    #[test]
    fn test_out_of_range_deadline_waits_indefinitely() {
        let now = Utc::now();
        let cfg = BreakpointConfig {
            deadline_secs: Some(u64::MAX),
            ..config(&[], ApprovalMode::Any)
        };
        let req = BreakpointGate::open(Uuid::now_v7(), "deploy", &cfg, None, now);
        assert_eq!(req.deadline, None);

        let req = BreakpointGate::open(Uuid::now_v7(), "deploy", &config(&[], ApprovalMode::Any), Some(i64::MAX as u64), now);
        assert_eq!(req.deadline, None);
    }

    #[test]
    fn test_late_decision_expires_request() {
        let now = Utc::now();
        let cfg = BreakpointConfig {
            deadline_secs: Some(10),
            on_expire: ExpiryAction::Escalate {
                node: "page".to_string(),
            },
            ..config(&["a"], ApprovalMode::Any)
        };
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &cfg, None, now);

        let late = now + Duration::seconds(3600);
        let status =
            BreakpointGate::vote(&mut req, Decision::approve("a").with_field("env", json!("prod")), late).unwrap();
        assert_eq!(status, BreakpointStatus::Expired);
        assert_eq!(req.status, BreakpointStatus::Expired);
        assert_eq!(req.resolved_at, Some(late));
        assert!(req.votes.is_empty());
        assert!(req.fields.is_empty());
        assert_eq!(
            BreakpointGate::resolution(&req),
            Some(GateResolution::Divert {
                target: "page".to_string()
            })
        );
    }

    #[test]
    fn test_late_decision_from_stranger_is_refused() {
        let now = Utc::now();
        let cfg = BreakpointConfig {
            deadline_secs: Some(10),
            ..config(&["a"], ApprovalMode::Any)
        };
        let mut req = BreakpointGate::open(Uuid::now_v7(), "deploy", &cfg, None, now);
        assert!(matches!(
            BreakpointGate::vote(&mut req, Decision::approve("mallory"), now + Duration::seconds(60)),
            Err(GateError::NotApprover { .. })
        ));
        assert_eq!(req.status, BreakpointStatus::Pending);
    }
}
