//! Graph validation, cycle detection and loop-body analysis.
//!
//! Uses `petgraph` to model the workflow as a directed graph. Topological
//! sort detects cycles; reachability from `iterate` edges determines loop
//! bodies, which must be closed (entered only through their loop's `iterate`
//! edges). The result is a [`GraphPlan`] the scheduler consults for regions
//! (the nodes driven by one scheduler invocation) and loop leaves.

use std::collections::{HashMap, HashSet, VecDeque};

use flowgate_types::breakpoint::ExpiryAction;
use flowgate_types::workflow::{EdgeType, NodeKind, SplitMode, WorkflowGraph};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// GraphPlan
// ---------------------------------------------------------------------------

/// Precomputed structure of a validated graph.
#[derive(Debug, Clone, Default)]
pub struct GraphPlan {
    /// Innermost loop owning each body node.
    owner: HashMap<String, String>,
    /// Full body (nested bodies included) of each loop.
    bodies: HashMap<String, HashSet<String>>,
    /// Nodes only reachable through breakpoint diversion; never activated as roots.
    dormant: HashSet<String>,
}

impl GraphPlan {
    /// Innermost loop whose body contains `node_id`.
    pub fn owner(&self, node_id: &str) -> Option<&str> {
        self.owner.get(node_id).map(String::as_str)
    }

    /// Nodes driven directly by `loop_id` (`None` = the root region), in
    /// declaration order.
    pub fn region<'a>(&self, graph: &'a WorkflowGraph, loop_id: Option<&str>) -> Vec<&'a str> {
        graph
            .nodes
            .iter()
            .filter(|n| self.owner(&n.id) == loop_id)
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Whether `node_id` lies anywhere inside the body of `loop_id`.
    pub fn in_body(&self, loop_id: &str, node_id: &str) -> bool {
        self.bodies.get(loop_id).is_some_and(|b| b.contains(node_id))
    }

    /// Direct body nodes of `loop_id` without outgoing edges; their items
    /// form the loop's output.
    pub fn leaves<'a>(&self, graph: &'a WorkflowGraph, loop_id: &str) -> Vec<&'a str> {
        self.region(graph, Some(loop_id))
            .into_iter()
            .filter(|id| graph.outgoing(id).next().is_none())
            .collect()
    }

    pub fn is_dormant(&self, node_id: &str) -> bool {
        self.dormant.contains(node_id)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the structure of a workflow graph.
///
/// Checks:
/// - at least one node; node ids unique, non-empty, free of `.`, `$`, `{`, `}`
/// - edges reference existing nodes
/// - no cycles
/// - `iterate` and `done` edges leave loop nodes only; every loop iterates
/// - loop bodies are closed, exports name direct body nodes
/// - no breakpoints inside loop bodies; diversion targets exist outside bodies
/// - at most one `start` node, without incoming edges
/// - branch rules and filter routes non-empty
pub fn validate_graph(graph: &WorkflowGraph) -> Result<GraphPlan, WorkflowError> {
    if graph.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        if node.id.is_empty() || node.id.contains(['.', '$', '{', '}']) || node.id.contains(char::is_whitespace)
        {
            return Err(WorkflowError::ValidationError(format!(
                "invalid node id '{}'",
                node.id
            )));
        }
        if index.insert(node.id.as_str(), i).is_some() {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
    }

    // Build directed graph and detect cycles
    let mut dag = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = graph.nodes.iter().map(|n| dag.add_node(n.id.as_str())).collect();
    for edge in &graph.edges {
        let from = index
            .get(edge.from.as_str())
            .ok_or_else(|| WorkflowError::UnknownNode(format!("edge from unknown node '{}'", edge.from)))?;
        let to = index
            .get(edge.to.as_str())
            .ok_or_else(|| WorkflowError::UnknownNode(format!("edge to unknown node '{}'", edge.to)))?;
        dag.add_edge(node_indices[*from], node_indices[*to], ());
    }
    toposort(&dag, None).map_err(|cycle| {
        let node_id = dag[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving node '{node_id}'"))
    })?;

    // Per-kind checks
    let mut starts = 0;
    for node in &graph.nodes {
        match &node.kind {
            NodeKind::Start => {
                starts += 1;
                if graph.incoming(&node.id).next().is_some() {
                    return Err(WorkflowError::ValidationError(format!(
                        "start node '{}' must not have incoming edges",
                        node.id
                    )));
                }
            }
            NodeKind::Branch { rules, .. } if rules.is_empty() => {
                return Err(WorkflowError::ValidationError(format!(
                    "branch node '{}' has no rules",
                    node.id
                )));
            }
            NodeKind::Split {
                mode: SplitMode::Filter { routes },
            } => {
                if routes.is_empty() {
                    return Err(WorkflowError::ValidationError(format!(
                        "split node '{}' has no filter routes",
                        node.id
                    )));
                }
                let unknown = graph
                    .outgoing(&node.id)
                    .filter_map(|(_, e)| e.label.as_deref())
                    .find(|label| !routes.iter().any(|r| r.label == *label));
                if let Some(label) = unknown {
                    return Err(WorkflowError::ValidationError(format!(
                        "split node '{}' has an edge labelled '{label}', which names no route",
                        node.id
                    )));
                }
            }
            NodeKind::Loop { .. } => {
                let iterates = graph
                    .outgoing(&node.id)
                    .any(|(_, e)| e.edge_type == EdgeType::Iterate);
                if !iterates {
                    return Err(WorkflowError::ValidationError(format!(
                        "loop node '{}' has no iterate edge",
                        node.id
                    )));
                }
            }
            _ => {}
        }
    }
    if starts > 1 {
        return Err(WorkflowError::ValidationError(
            "workflow has more than one start node".to_string(),
        ));
    }

    for edge in &graph.edges {
        if matches!(edge.edge_type, EdgeType::Iterate | EdgeType::Done) {
            let is_loop = graph
                .node(&edge.from)
                .is_some_and(|n| matches!(n.kind, NodeKind::Loop { .. }));
            if !is_loop {
                return Err(WorkflowError::ValidationError(format!(
                    "{:?} edge '{}' -> '{}' must leave a loop node",
                    edge.edge_type, edge.from, edge.to
                )));
            }
        }
    }

    // Loop bodies
    let mut bodies: HashMap<String, HashSet<String>> = HashMap::new();
    for node in graph.nodes.iter().filter(|n| matches!(n.kind, NodeKind::Loop { .. })) {
        let body = reachable_body(graph, &node.id);
        for edge in &graph.edges {
            if !body.contains(&edge.to) || body.contains(&edge.from) {
                continue;
            }
            if !(edge.from == node.id && edge.edge_type == EdgeType::Iterate) {
                return Err(WorkflowError::OpenLoopBody(format!(
                    "edge '{}' -> '{}' enters the body of loop '{}'",
                    edge.from, edge.to, node.id
                )));
            }
        }
        bodies.insert(node.id.clone(), body);
    }

    // Innermost owner: the containing loop with the smallest body.
    let mut owner: HashMap<String, String> = HashMap::new();
    for node in &graph.nodes {
        let innermost = bodies
            .iter()
            .filter(|(_, body)| body.contains(&node.id))
            .min_by_key(|(_, body)| body.len())
            .map(|(loop_id, _)| loop_id.clone());
        if let Some(loop_id) = innermost {
            owner.insert(node.id.clone(), loop_id);
        }
    }

    for node in &graph.nodes {
        if let NodeKind::Loop { export, .. } = &node.kind {
            for exported in export {
                if owner.get(exported) != Some(&node.id) {
                    return Err(WorkflowError::ValidationError(format!(
                        "loop '{}' exports '{}', which is not in its body",
                        node.id, exported
                    )));
                }
            }
        }
    }

    // Breakpoints
    let mut dormant = HashSet::new();
    for node in &graph.nodes {
        let Some(bp) = &node.breakpoint else {
            continue;
        };
        if owner.contains_key(&node.id) {
            return Err(WorkflowError::ValidationError(format!(
                "breakpoint on '{}' is inside a loop body",
                node.id
            )));
        }
        let escalate = match &bp.on_expire {
            ExpiryAction::Escalate { node } => Some(node),
            ExpiryAction::Reject => None,
        };
        for target in bp.on_reject.iter().chain(escalate) {
            if !index.contains_key(target.as_str()) {
                return Err(WorkflowError::UnknownNode(format!(
                    "breakpoint on '{}' diverts to unknown node '{target}'",
                    node.id
                )));
            }
            if owner.contains_key(target) {
                return Err(WorkflowError::ValidationError(format!(
                    "breakpoint on '{}' diverts into a loop body ('{target}')",
                    node.id
                )));
            }
            if graph.incoming(target).next().is_none() {
                dormant.insert(target.clone());
            }
        }
    }

    Ok(GraphPlan {
        owner,
        bodies,
        dormant,
    })
}

/// Every node reachable from the targets of `loop_id`'s iterate edges.
fn reachable_body(graph: &WorkflowGraph, loop_id: &str) -> HashSet<String> {
    let mut body = HashSet::new();
    let mut queue: VecDeque<&str> = graph
        .outgoing(loop_id)
        .filter(|(_, e)| e.edge_type == EdgeType::Iterate)
        .map(|(_, e)| e.to.as_str())
        .collect();
    while let Some(id) = queue.pop_front() {
        if body.insert(id.to_string()) {
            queue.extend(graph.outgoing(id).map(|(_, e)| e.to.as_str()));
        }
    }
    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
