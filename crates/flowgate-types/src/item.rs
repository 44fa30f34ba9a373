//! Item model: the record-level unit exchanged between nodes, and the
//! `StepResult` that groups a node's output items by port.
//!
//! Items are immutable once produced. They are built with the `with_*`
//! builders and only read through accessors afterwards; a `StepResult` is
//! shared behind an `Arc` once it has been posted to the execution context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, NodeError};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Reference to a blob stored outside the item payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRef {
    /// Storage key of the blob (opaque to the engine).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Which node produced an item, and at which output index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOrigin {
    pub node_id: String,
    pub index: usize,
}

/// Provenance link from an output item to one of the node's input items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairedItem {
    /// Index of the source item within its input port.
    pub item: usize,
    /// Input port the source item arrived on.
    #[serde(default)]
    pub input: usize,
}

impl PairedItem {
    pub fn new(item: usize, input: usize) -> Self {
        Self { item, input }
    }
}

/// Error carried by an item whose processing failed under `continue` policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One record flowing along a data edge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    json: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    binary: BTreeMap<String, BinaryRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<ItemOrigin>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    paired: Vec<PairedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ItemError>,
}

impl Item {
    /// Create an item holding the given payload.
    pub fn new(json: Value) -> Self {
        Self {
            json,
            ..Default::default()
        }
    }

    /// Create an error-only item (payload is `null`).
    pub fn from_error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            json: Value::Null,
            error: Some(ItemError {
                kind,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn with_binary(mut self, name: impl Into<String>, binary: BinaryRef) -> Self {
        self.binary.insert(name.into(), binary);
        self
    }

    pub fn with_binaries(mut self, binaries: BTreeMap<String, BinaryRef>) -> Self {
        self.binary.extend(binaries);
        self
    }

    pub fn with_origin(mut self, node_id: impl Into<String>, index: usize) -> Self {
        self.origin = Some(ItemOrigin {
            node_id: node_id.into(),
            index,
        });
        self
    }

    /// Replace the pairing with a single source link.
    pub fn paired_with(mut self, item: usize, input: usize) -> Self {
        self.paired = vec![PairedItem::new(item, input)];
        self
    }

    /// Replace the pairing with several source links (N:1 transforms).
    pub fn with_pairing(mut self, paired: Vec<PairedItem>) -> Self {
        self.paired = paired;
        self
    }

    pub fn json(&self) -> &Value {
        &self.json
    }

    pub fn binary(&self) -> &BTreeMap<String, BinaryRef> {
        &self.binary
    }

    pub fn origin(&self) -> Option<&ItemOrigin> {
        self.origin.as_ref()
    }

    pub fn paired(&self) -> &[PairedItem] {
        &self.paired
    }

    pub fn error(&self) -> Option<&ItemError> {
        self.error.as_ref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Look up a dotted field inside the payload (`a.b.c`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(&self.json, |value, segment| value.get(segment))
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome status of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    /// Some (not all) items failed and were contained as error items.
    Partial,
    /// The node failed; no items were produced on any port.
    Error,
}

/// Outcome status of one item inside an `items`-mode execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error,
    /// The input item already carried an error and was forwarded unchanged.
    Forwarded,
}

/// Per-item sub-trace entry for `items`-mode executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTrace {
    pub index: usize,
    pub status: ItemStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Timing metadata of a node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Number of attempts made (1 unless retried).
    pub attempts: u32,
}

impl StepTiming {
    pub fn new(started_at: DateTime<Utc>, finished_at: DateTime<Utc>, attempts: u32) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            started_at,
            finished_at,
            duration_ms,
            attempts,
        }
    }

    /// Zero-length timing at `now`, used for control nodes that do no work.
    pub fn instant() -> Self {
        let now = Utc::now();
        Self::new(now, now, 1)
    }
}

/// Output of one node execution, indexed `[output_port][item_index]`.
///
/// Constructors enforce the status invariants: `Error` carries no items and
/// always has a node-level error; `Partial` is only produced when at least
/// one output item carries a contained error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    node_id: String,
    status: StepStatus,
    outputs: Vec<Vec<Item>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<NodeError>,
    timing: StepTiming,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    item_traces: Vec<ItemTrace>,
}

impl StepResult {
    /// A successful result. Attaching item traces with
    /// [`with_item_traces`](Self::with_item_traces) may downgrade it to
    /// `Partial`.
    pub fn success(node_id: impl Into<String>, outputs: Vec<Vec<Item>>, timing: StepTiming) -> Self {
        Self {
            node_id: node_id.into(),
            status: StepStatus::Success,
            outputs,
            error: None,
            timing,
            item_traces: Vec::new(),
        }
    }

    /// A failed result. Any items are discarded.
    pub fn failed(error: NodeError, timing: StepTiming) -> Self {
        Self {
            node_id: error.node_id.clone(),
            status: StepStatus::Error,
            outputs: Vec::new(),
            error: Some(error),
            timing,
            item_traces: Vec::new(),
        }
    }

    /// Attach the per-item sub-trace and derive `Partial` from it.
    pub fn with_item_traces(mut self, traces: Vec<ItemTrace>) -> Self {
        if self.status == StepStatus::Success
            && traces.iter().any(|t| t.status == ItemStatus::Error)
        {
            self.status = StepStatus::Partial;
        }
        self.item_traces = traces;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn is_error(&self) -> bool {
        self.status == StepStatus::Error
    }

    pub fn outputs(&self) -> &[Vec<Item>] {
        &self.outputs
    }

    /// Items on a given output port (empty when the port does not exist).
    pub fn port(&self, port: usize) -> &[Item] {
        self.outputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn error(&self) -> Option<&NodeError> {
        self.error.as_ref()
    }

    pub fn timing(&self) -> &StepTiming {
        &self.timing
    }

    pub fn item_traces(&self) -> &[ItemTrace] {
        &self.item_traces
    }

    /// Total number of items across all ports.
    pub fn item_count(&self) -> usize {
        self.outputs.iter().map(Vec::len).sum()
    }
}
