//! Event types for the flowgate event bus.
//!
//! `WorkflowEvent` is broadcast during run execution. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breakpoint::BreakpointRequest;
use crate::error::ErrorKind;

/// Events emitted during workflow execution.
///
/// Subscribers include approval notifiers (which forward
/// `BreakpointRequested` to humans), dashboards and log shippers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow run has started.
    RunStarted { run_id: Uuid, workflow_name: String },

    /// A node has started executing.
    NodeStarted {
        run_id: Uuid,
        node_id: String,
        module_id: String,
    },

    /// A node completed (successfully or partially).
    NodeCompleted {
        run_id: Uuid,
        node_id: String,
        item_count: usize,
        duration_ms: u64,
    },

    /// A node failed.
    NodeFailed {
        run_id: Uuid,
        node_id: String,
        kind: ErrorKind,
        error: String,
        will_retry: bool,
    },

    /// A run completed successfully.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        nodes_completed: u32,
    },

    /// A run failed.
    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        node_id: Option<String>,
        kind: ErrorKind,
        error: String,
    },

    /// A run was suspended at a breakpoint.
    RunSuspended {
        run_id: Uuid,
        node_id: String,
        deadline: Option<DateTime<Utc>>,
    },

    /// A suspended run was resumed.
    RunResumed { run_id: Uuid, node_id: String },

    /// A breakpoint request is waiting for approvers.
    BreakpointRequested { request: BreakpointRequest },

    /// A breakpoint request was resolved.
    BreakpointResolved { request: BreakpointRequest },

    /// Appending to the trace failed (the run continues).
    RecorderFailed { run_id: Uuid, error: String },

    /// Persisting run state failed (the run continues).
    PersistenceFailed { run_id: Uuid, error: String },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::NodeStarted { run_id, .. }
            | WorkflowEvent::NodeCompleted { run_id, .. }
            | WorkflowEvent::NodeFailed { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunSuspended { run_id, .. }
            | WorkflowEvent::RunResumed { run_id, .. }
            | WorkflowEvent::RecorderFailed { run_id, .. }
            | WorkflowEvent::PersistenceFailed { run_id, .. } => *run_id,
            WorkflowEvent::BreakpointRequested { request }
            | WorkflowEvent::BreakpointResolved { request } => request.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagged() {
        let event = WorkflowEvent::NodeFailed {
            run_id: Uuid::nil(),
            node_id: "fetch".to_string(),
            kind: ErrorKind::NodeTimeout,
            error: "timed out".to_string(),
            will_retry: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["kind"], "node_timeout");
        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::NodeFailed { will_retry: true, .. }));
        assert_eq!(parsed.run_id(), Uuid::nil());
    }
}
