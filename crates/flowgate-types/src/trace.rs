//! Execution trace types.
//!
//! The trace is an append-only, totally ordered, run-keyed log. Each entry
//! carries a per-run sequence number; entries are never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::breakpoint::BreakpointStatus;
use crate::error::NodeError;
use crate::item::{Item, ItemTrace, StepStatus};
use crate::workflow::{NodeStatus, RunStatus};

/// One immutable trace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub run_id: Uuid,
    /// Monotonic, gap-free per-run sequence number starting at 1.
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: TraceEvent,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    /// The run moved between lifecycle states.
    RunStatus { from: RunStatus, to: RunStatus },
    /// A node moved between lifecycle states.
    NodeStatus {
        node_id: String,
        status: NodeStatus,
        /// Loop scope the node ran in (`None` for the root scope).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    /// A node finished; full input/output record.
    Step(Box<StepTrace>),
    /// A breakpoint request changed status.
    Breakpoint {
        request_id: Uuid,
        node_id: String,
        status: BreakpointStatus,
    },
}

/// Full record of one node execution, sufficient to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_id: String,
    /// Registered step type (or control-node kind).
    pub module_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    /// Parameters after `${...}` resolution (unresolved template for `items` mode).
    pub parameters: Value,
    /// Input items keyed by input port.
    pub input_items: BTreeMap<usize, Vec<Item>>,
    /// Output items indexed by output port.
    pub output_items: Vec<Vec<Item>>,
    pub item_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_traces: Vec<ItemTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl TraceEntry {
    /// The step record, if this entry carries one.
    pub fn step(&self) -> Option<&StepTrace> {
        match &self.event {
            TraceEvent::Step(step) => Some(step),
            _ => None,
        }
    }
}
