//! Durable continuation state for suspended runs.
//!
//! A run suspends only after every in-flight node has finished, so its
//! position is fully described by the state of each edge and node (the
//! [`Frontier`]) plus the execution context. `SuspendedRun` bundles both with
//! the graph itself and the open breakpoint requests; a fresh process can
//! resume from it without any in-memory state.
//!
//! `CheckpointManager` wraps a [`RunStateRepository`] and maps storage
//! conflicts onto stale-resume errors.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowgate_types::breakpoint::BreakpointRequest;
use flowgate_types::error::RepositoryError;
use flowgate_types::item::Item;
use flowgate_types::workflow::WorkflowGraph;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository::run_state::RunStateRepository;

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// Frontier
// ---------------------------------------------------------------------------

/// Delivery state of one edge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "items", rename_all = "snake_case")]
pub enum EdgeState {
    #[default]
    Pending,
    /// The source finished and activated this edge (items empty for
    /// `control`/`done` edges).
    Fired(Vec<Item>),
    /// The source finished (or was skipped) without activating this edge.
    Dead,
}

impl EdgeState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, EdgeState::Pending)
    }
}

/// Scheduling state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    /// Ready, but gated by an open breakpoint request.
    WaitingApproval { request_id: Uuid },
    /// Approved; runs on the next scheduling pass.
    Released,
    Completed,
    Failed,
    Skipped,
}

impl NodeState {
    /// Whether the scheduler may still start this node.
    pub fn is_open(&self) -> bool {
        matches!(self, NodeState::Pending | NodeState::Released)
    }
}

/// The engine's position inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
    /// Trigger items emitted by the start node.
    pub trigger: Vec<Item>,
    /// One state per graph edge, by declaration index.
    pub edges: Vec<EdgeState>,
    pub nodes: BTreeMap<String, NodeState>,
    /// Approver fields merged over a node's parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, Map<String, Value>>,
    /// Inputs for nodes activated by breakpoint diversion.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forced: BTreeMap<String, Vec<Vec<Item>>>,
    #[serde(default)]
    pub nodes_completed: u32,
}

impl Frontier {
    /// Fresh frontier: every edge and node pending.
    pub fn new(graph: &WorkflowGraph, trigger: Vec<Item>) -> Self {
        Self {
            trigger,
            edges: vec![EdgeState::Pending; graph.edges.len()],
            nodes: graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeState::Pending))
                .collect(),
            overrides: BTreeMap::new(),
            forced: BTreeMap::new(),
            nodes_completed: 0,
        }
    }

    pub fn node(&self, node_id: &str) -> NodeState {
        self.nodes.get(node_id).copied().unwrap_or_default()
    }

    pub fn set_node(&mut self, node_id: &str, state: NodeState) {
        self.nodes.insert(node_id.to_string(), state);
    }

    pub fn edge(&self, index: usize) -> &EdgeState {
        self.edges.get(index).unwrap_or(&EdgeState::Pending)
    }

    pub fn set_edge(&mut self, index: usize, state: EdgeState) {
        if let Some(edge) = self.edges.get_mut(index) {
            *edge = state;
        }
    }

    /// Nodes gated by the given request.
    pub fn gated_by(&self, request_id: Uuid) -> Option<&str> {
        self.nodes.iter().find_map(|(id, state)| match state {
            NodeState::WaitingApproval { request_id: r } if *r == request_id => Some(id.as_str()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// SuspendedRun
// ---------------------------------------------------------------------------

/// Everything needed to resume a suspended run in a fresh process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedRun {
    pub run_id: Uuid,
    /// Bumped on every persisted mutation; stores compare-and-swap on it.
    pub sequence: u64,
    pub graph: WorkflowGraph,
    pub context: ExecutionContext,
    pub frontier: Frontier,
    /// Requests of this run: pending ones plus those resolved since the last
    /// continuation.
    pub requests: Vec<BreakpointRequest>,
    pub started_at: DateTime<Utc>,
    pub suspended_at: DateTime<Utc>,
}

impl SuspendedRun {
    pub fn request(&self, request_id: Uuid) -> Option<&BreakpointRequest> {
        self.requests.iter().find(|r| r.id == request_id)
    }

    pub fn request_mut(&mut self, request_id: Uuid) -> Option<&mut BreakpointRequest> {
        self.requests.iter_mut().find(|r| r.id == request_id)
    }

    /// Requests still waiting for a decision.
    pub fn pending(&self) -> impl Iterator<Item = &BreakpointRequest> {
        self.requests.iter().filter(|r| !r.status.is_resolved())
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists and restores suspended runs.
///
/// Generic over `S: RunStateRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: RunStateRepository> {
    repo: Arc<S>,
}

impl<S: RunStateRepository> CheckpointManager<S> {
    pub fn new(repo: Arc<S>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &S {
        &self.repo
    }

    /// Persist `run`; `expected_sequence` as in [`RunStateRepository::save_suspended`].
    pub async fn save(&self, run: &SuspendedRun, expected_sequence: Option<u64>) -> Result<(), CheckpointError> {
        self.repo
            .save_suspended(run, expected_sequence)
            .await
            .map_err(|e| CheckpointError::from_repository(run.run_id, e))?;

        tracing::debug!(
            run_id = %run.run_id,
            sequence = run.sequence,
            pending = run.pending().count(),
            "checkpointed suspended run"
        );
        Ok(())
    }

    pub async fn load(&self, run_id: Uuid) -> Result<SuspendedRun, CheckpointError> {
        self.repo
            .load_suspended(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn find_by_request(&self, request_id: Uuid) -> Result<SuspendedRun, CheckpointError> {
        self.repo
            .find_by_request(&request_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::RequestNotFound(request_id))
    }

    pub async fn list_pending(&self, approver: Option<&str>) -> Result<Vec<BreakpointRequest>, CheckpointError> {
        self.repo
            .list_pending(approver)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Take a run out of the store before it continues, archiving its
    /// resolved requests. Fails with `Stale` if another writer got there first.
    pub async fn release(&self, run: &SuspendedRun) -> Result<(), CheckpointError> {
        let resolved: Vec<BreakpointRequest> = run
            .requests
            .iter()
            .filter(|r| r.status.is_resolved())
            .cloned()
            .collect();
        self.repo
            .archive(&run.run_id, run.sequence, &resolved)
            .await
            .map_err(|e| CheckpointError::from_repository(run.run_id, e))?;

        tracing::debug!(
            run_id = %run.run_id,
            sequence = run.sequence,
            archived = resolved.len(),
            "released suspended run"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Another writer updated the run since it was loaded.
    #[error("stale resume of run {0}: state changed since it was loaded")]
    Stale(Uuid),

    #[error("suspended run not found: {0}")]
    RunNotFound(Uuid),

    #[error("breakpoint request not found: {0}")]
    RequestNotFound(Uuid),
}

impl CheckpointError {
    fn from_repository(run_id: Uuid, error: RepositoryError) -> Self {
        match error {
            RepositoryError::Conflict(_) => CheckpointError::Stale(run_id),
            RepositoryError::NotFound => CheckpointError::RunNotFound(run_id),
            other => CheckpointError::Repository(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
