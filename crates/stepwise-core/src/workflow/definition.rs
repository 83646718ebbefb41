//! Workflow definition parsing and validation.
//!
//! Converts YAML into [`WorkflowGraph`] and [`Plan`] values and checks their
//! structural constraints before anything is executed.

use std::collections::HashSet;
use std::path::Path;

use stepwise_types::workflow::{Plan, Step, WorkflowGraph};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// An edge or dependency names a step that is not declared.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Plan dependencies contain a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a graph-mode workflow.
pub fn parse_graph_yaml(yaml: &str) -> Result<WorkflowGraph, DefinitionError> {
    let graph: WorkflowGraph =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_graph(&graph)?;
    Ok(graph)
}

/// Parse and validate a plan-mode workflow.
pub fn parse_plan_yaml(yaml: &str) -> Result<Plan, DefinitionError> {
    let plan: Plan =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

pub fn serialize_graph_yaml(graph: &WorkflowGraph) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(graph).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn serialize_plan_yaml(plan: &Plan) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(plan).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load a graph-mode workflow from a YAML file.
pub async fn load_graph_file(path: &Path) -> Result<WorkflowGraph, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_graph_yaml(&content)
}

/// Load a plan from a YAML file.
pub async fn load_plan_file(path: &Path) -> Result<Plan, DefinitionError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_plan_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a graph-mode workflow.
///
/// Checks:
/// - At least one step exists and step IDs are unique
/// - Every edge names declared steps and the entry step is declared
/// - At least one step has no outgoing edges
/// - Step limits are non-zero where set
///
/// Cycles are allowed; unreachable steps are logged, not rejected.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<(), DefinitionError> {
    validate_steps(&graph.steps)?;
    dag::check_graph_structure(graph)?;
    Ok(())
}

/// Validate a plan: unique IDs, known dependencies, no cycles.
pub fn validate_plan(plan: &Plan) -> Result<(), DefinitionError> {
    validate_steps(&plan.steps)?;
    dag::execution_waves(plan)?;
    Ok(())
}

fn validate_steps(steps: &[Step]) -> Result<(), DefinitionError> {
    if steps.is_empty() {
        return Err(DefinitionError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in steps {
        if step.id.is_empty() {
            return Err(DefinitionError::Validation(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(DefinitionError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "step '{}': timeout must be > 0",
                step.id
            )));
        }
        if step.max_visits == Some(0) {
            return Err(DefinitionError::Validation(format!(
                "step '{}': max_visits must be >= 1",
                step.id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
