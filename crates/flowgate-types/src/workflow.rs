//! Workflow graph domain types for flowgate.
//!
//! Defines the canonical representation of a workflow: nodes, the typed edges
//! between them, and per-node policies (timeouts, retries, breakpoints). The
//! same structure is accepted from YAML and JSON and is stored verbatim inside
//! suspended-run snapshots so that a fresh process can resume a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::breakpoint::BreakpointConfig;
use crate::condition::Condition;
use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Workflow Graph
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// UUIDv7 assigned on first save.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Nodes of the graph. Declaration order is the tie-breaker for every
    /// ordering decision the scheduler makes.
    pub nodes: Vec<NodeDefinition>,
    /// Typed edges between nodes.
    #[serde(default)]
    pub edges: Vec<ControlEdge>,
    /// Run-wide defaults.
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowGraph {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges arriving at `node_id`, in declaration order.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = (usize, &'a ControlEdge)> + 'a {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.to == node_id)
    }

    /// Edges leaving `node_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = (usize, &'a ControlEdge)> + 'a {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.from == node_id)
    }
}

/// Run-wide defaults applied when a node does not override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Default per-item error policy for `items`-mode steps.
    #[serde(default)]
    pub item_error_policy: ItemErrorPolicy,
    /// Whole-run timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Node Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// User-defined node ID (e.g. "fetch-orders"). Unique within a workflow.
    pub id: String,
    /// Human-readable node name.
    #[serde(default)]
    pub name: String,
    /// What the node does.
    pub kind: NodeKind,
    /// Parameters, possibly containing `${...}` placeholders.
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Suspend the run for human approval before this node executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakpoint: Option<BreakpointConfig>,
    /// Node-level timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the workflow's per-item error policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_error_policy: Option<ItemErrorPolicy>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NodeDefinition {
    /// A node with empty parameters and no policies.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            parameters: empty_object(),
            breakpoint: None,
            timeout_secs: None,
            retry: None,
            item_error_policy: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_breakpoint(mut self, breakpoint: BreakpointConfig) -> Self {
        self.breakpoint = Some(breakpoint);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_item_error_policy(mut self, policy: ItemErrorPolicy) -> Self {
        self.item_error_policy = Some(policy);
        self
    }

    /// Short label of the node kind, used in logs and traces.
    pub fn module_id(&self) -> String {
        match &self.kind {
            NodeKind::Step { step } => step.clone(),
            NodeKind::Start => "start".to_string(),
            NodeKind::Branch { .. } => "branch".to_string(),
            NodeKind::Fork => "fork".to_string(),
            NodeKind::Merge { .. } => "merge".to_string(),
            NodeKind::Split { .. } => "split".to_string(),
            NodeKind::Loop { .. } => "loop".to_string(),
        }
    }
}

/// The kind of node.
///
/// Internally tagged by `type`:
/// ```yaml
/// kind:
///   type: step
///   step: http.request
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Emits the run's trigger items.
    Start,
    /// Invokes a step from the catalog by its registered type name.
    Step { step: String },
    /// Routes to exactly one edge label by first-matching rule.
    Branch {
        rules: Vec<BranchRule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_label: Option<String>,
    },
    /// Activates every outgoing edge with the node's input items.
    Fork,
    /// Consumes several input ports and combines them.
    Merge { strategy: MergeStrategy },
    /// Distributes input items across output ports.
    Split { mode: SplitMode },
    /// Runs the `iterate` subgraph once per source element.
    Loop {
        /// Template producing the collection; defaults to the node's input items.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        /// Body node IDs whose final-iteration results are copied to the parent scope.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        export: Vec<String>,
    },
}

/// One branch rule: when `condition` holds, route to edges labelled `label`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRule {
    pub label: String,
    pub condition: Condition,
}

/// How a merge node combines its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Concatenate inputs, lowest input port first.
    Append,
    /// Zip items at equal index; shorter inputs contribute nothing.
    CombineByIndex,
    /// Group across inputs by a key field and merge matching groups.
    CombineByKey {
        key: String,
        #[serde(default)]
        keep_unmatched: bool,
    },
    /// Cartesian product of all inputs.
    Multiplex,
    /// Append, but only once every input branch has fired.
    WaitAll,
}

/// How a split node distributes its input items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitMode {
    /// Every output port receives every item.
    Clone,
    /// Round-robin partition across output ports, no duplication.
    Distribute,
    /// Port `i` receives the items for which `routes[i].condition` holds.
    Filter { routes: Vec<SplitRoute> },
}

/// One filter route of a split node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRoute {
    pub label: String,
    pub condition: Condition,
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// Edge semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Carries items from an output port to an input port.
    #[default]
    Data,
    /// Pure routing signal, never carries items.
    Control,
    /// From a loop node into its body; carries the current iteration item.
    Iterate,
    /// From a loop node on exhaustion; never carries items.
    Done,
}

impl EdgeType {
    /// Whether items travel along edges of this type.
    pub fn carries_items(&self) -> bool {
        matches!(self, EdgeType::Data | EdgeType::Iterate)
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEdge {
    pub from: String,
    #[serde(default)]
    pub from_port: usize,
    pub to: String,
    #[serde(default)]
    pub to_port: usize,
    #[serde(default)]
    pub edge_type: EdgeType,
    /// Branch label this edge belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Fires only when the source node fails, carrying the error as an item.
    #[serde(default)]
    pub on_error: bool,
}

impl ControlEdge {
    /// A data edge between port 0 of `from` and port 0 of `to`.
    pub fn data(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_port: 0,
            to: to.into(),
            to_port: 0,
            edge_type: EdgeType::Data,
            label: None,
            on_error: false,
        }
    }

    pub fn typed(from: impl Into<String>, to: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            edge_type,
            ..Self::data(from, to)
        }
    }

    pub fn from_port(mut self, port: usize) -> Self {
        self.from_port = port;
        self
    }

    pub fn to_port(mut self, port: usize) -> Self {
        self.to_port = port;
        self
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn error_route(mut self) -> Self {
        self.on_error = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What an `items`-mode step does when one item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorPolicy {
    /// Abort the node, discarding unprocessed items.
    #[default]
    Stop,
    /// Emit an error-only item and proceed.
    Continue,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Error kinds eligible for retry.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_retry_on() -> Vec<ErrorKind> {
    vec![ErrorKind::NodeTimeout, ErrorKind::System]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_on: default_retry_on(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Suspended,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Lifecycle status of an individual node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Running,
    Completed,
    Partial,
    Failed,
    Skipped,
    WaitingApproval,
}

/// Why a run failed: the triggering node, the error kind, and a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edge_defaults_to_data() {
        let edge: ControlEdge = serde_json::from_value(json!({"from": "a", "to": "b"})).unwrap();
        assert_eq!(edge.edge_type, EdgeType::Data);
        assert_eq!(edge.from_port, 0);
        assert!(!edge.on_error);
        assert!(edge.edge_type.carries_items());
        assert!(!EdgeType::Control.carries_items());
        assert!(!EdgeType::Done.carries_items());
    }

    #[test]
    fn test_graph_yaml_parse() {
        let yaml = r#"
name: order-sync
nodes:
  - id: start
    kind: { type: start }
  - id: fetch
    kind: { type: step, step: http.request }
    parameters:
      url: "https://example.com/orders/${$item.id}"
    retry:
      max_attempts: 5
  - id: route
    kind:
      type: branch
      rules:
        - label: big
          condition: { size: big }
      default_label: small
  - id: join
    kind:
      type: merge
      strategy: { type: combine_by_key, key: id }
edges:
  - { from: start, to: fetch }
  - { from: fetch, to: route }
  - { from: route, to: join, label: big }
  - { from: route, to: join, to_port: 1, label: small, edge_type: data }
"#;
        let graph: WorkflowGraph = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.version, "1.0.0");
        let fetch = graph.node("fetch").unwrap();
        assert_eq!(fetch.module_id(), "http.request");
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.retry_on, vec![ErrorKind::NodeTimeout, ErrorKind::System]);
        assert_eq!(graph.incoming("join").count(), 2);
        assert_eq!(graph.outgoing("route").count(), 2);
        match &graph.node("join").unwrap().kind {
            NodeKind::Merge {
                strategy: MergeStrategy::CombineByKey { key, keep_unmatched },
            } => {
                assert_eq!(key, "id");
                assert!(!keep_unmatched);
            }
            other => panic!("expected merge node, got {other:?}"),
        }
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
    }
}
