//! Workflow definition parsing and validation.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowGraph`,
//! and runs the structural checks of [`super::dag::validate_graph`] plus
//! catalog checks against a [`StepRegistry`].

use flowgate_types::workflow::{NodeKind, WorkflowGraph};
use thiserror::Error;

use super::dag::{GraphPlan, validate_graph};
use super::step::StepRegistry;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// An edge references an unknown node.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A loop body is entered or left other than through its loop node.
    #[error("loop body not closed: {0}")]
    OpenLoopBody(String),

    /// A step node names a step type missing from the catalog.
    #[error("unknown step type '{step}' on node '{node}'")]
    UnknownStep { node: String, step: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowGraph`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowGraph, WorkflowError> {
    let graph: WorkflowGraph =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&graph)?;
    Ok(graph)
}

/// Parse a JSON string into a validated `WorkflowGraph`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowGraph, WorkflowError> {
    let graph: WorkflowGraph =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&graph)?;
    Ok(graph)
}

/// Serialize a `WorkflowGraph` to a YAML string.
pub fn serialize_workflow_yaml(graph: &WorkflowGraph) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(graph).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow and return its execution plan.
///
/// Checks the workflow name in addition to the graph structure.
pub fn validate_definition(graph: &WorkflowGraph) -> Result<GraphPlan, WorkflowError> {
    if graph.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    validate_graph(graph)
}

/// Check that every step node names a registered step type.
pub fn validate_steps(graph: &WorkflowGraph, registry: &StepRegistry) -> Result<(), WorkflowError> {
    for node in &graph.nodes {
        if let NodeKind::Step { step } = &node.kind {
            if !registry.contains(step) {
                return Err(WorkflowError::UnknownStep {
                    node: node.id.clone(),
                    step: step.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: triage
nodes:
  - id: start
    kind: { type: start }
  - id: classify
    kind: { type: step, step: classify }
edges:
  - { from: start, to: classify }
"#;

    #[test]
    fn test_parse_yaml_and_roundtrip() {
        let graph = parse_workflow_yaml(YAML).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        let yaml = serialize_workflow_yaml(&graph).unwrap();
        let again = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(again.edges.len(), 1);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"name": "j", "nodes": [{"id": "a", "kind": {"type": "fork"}}]}"#;
        assert!(parse_workflow_json(json).is_ok());
        assert!(matches!(
            parse_workflow_json("{not json"),
            Err(WorkflowError::ParseError(_))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = parse_workflow_yaml(&YAML.replace("name: triage", "name: \"\"")).unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(_)));
    }

    #[test]
    fn test_validate_steps_against_registry() {
        let graph = parse_workflow_yaml(YAML).unwrap();
        let err = validate_steps(&graph, &StepRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("classify"));
    }
}
