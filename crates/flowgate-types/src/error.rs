use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in flowgate-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Closed error taxonomy shared by node results, run failures and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A `${...}` reference could not be resolved.
    Resolution,
    /// A resolved parameter or output did not match its declared type.
    TypeMismatch,
    /// Opaque failure raised by a step body.
    StepRuntime,
    /// Transient failure raised by a step (retryable by default).
    System,
    /// A node (or the whole run) exceeded its deadline.
    NodeTimeout,
    /// A branch node found no matching rule and has no default edge.
    NoBranchMatched,
    /// A breakpoint was rejected (or expired into rejection).
    BreakpointRejected,
    /// State could not be persisted or restored.
    Persistence,
    /// The run was cancelled.
    Cancelled,
    /// The workflow definition is structurally invalid.
    Validation,
}

impl ErrorKind {
    /// Stable snake_case name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::TypeMismatch => "type_mismatch",
            ErrorKind::StepRuntime => "step_runtime",
            ErrorKind::System => "system",
            ErrorKind::NodeTimeout => "node_timeout",
            ErrorKind::NoBranchMatched => "no_branch_matched",
            ErrorKind::BreakpointRejected => "breakpoint_rejected",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Validation => "validation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node-level failure: which node, what kind, and a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub node_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(node_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node '{}' failed ({}): {}", self.node_id, self.kind, self.message)
    }
}
