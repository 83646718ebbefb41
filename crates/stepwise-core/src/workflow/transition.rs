//! Next-step selection for both execution modes.

use std::collections::HashSet;

use serde_json::{Map, Value};
use stepwise_types::execution::{ErrorKind, ExecutionError};
use stepwise_types::workflow::{Edge, EdgeCondition, Plan, Step, WorkflowGraph};

use super::expression::{ExpressionEvaluator, edge_context};

/// The last step result, as seen by edge conditions.
#[derive(Debug, Clone, Copy)]
pub struct LastResult<'a> {
    pub step_id: &'a str,
    pub success: bool,
    pub outputs: &'a Map<String, Value>,
    pub memory: &'a Value,
}

/// Where graph execution goes after a step.
#[derive(Debug, Clone, Copy)]
pub enum Transition<'g> {
    Next(&'g Edge),
    /// The step has no outgoing edges.
    Finished,
}

/// Pick the first matching outgoing edge in ascending priority order.
///
/// A non-terminal step with no matching edge is a `NODE_NOT_FOUND` error.
/// A condition expression that fails to evaluate is an
/// `INVALID_CONFIGURATION` error.
pub fn next_edge<'g>(
    graph: &'g WorkflowGraph,
    last: LastResult<'_>,
    evaluator: &ExpressionEvaluator,
) -> Result<Transition<'g>, ExecutionError> {
    let outgoing = graph.outgoing(last.step_id);
    if outgoing.is_empty() {
        return Ok(Transition::Finished);
    }

    for edge in outgoing {
        if edge_matches(edge, last, evaluator)? {
            tracing::debug!(
                from = %edge.source,
                to = %edge.target,
                priority = edge.priority,
                "edge selected"
            );
            return Ok(Transition::Next(edge));
        }
    }

    Err(ExecutionError::new(
        ErrorKind::NodeNotFound,
        format!(
            "no outgoing edge of step '{}' matches its {} result",
            last.step_id,
            if last.success { "successful" } else { "failed" }
        ),
    )
    .with_context("step_id", last.step_id))
}

fn edge_matches(edge: &Edge, last: LastResult<'_>, evaluator: &ExpressionEvaluator) -> Result<bool, ExecutionError> {
    Ok(match &edge.condition {
        EdgeCondition::Always => true,
        EdgeCondition::OnSuccess => last.success,
        EdgeCondition::OnFailure => !last.success,
        EdgeCondition::Expression { expression } => {
            let context = edge_context(
                last.memory,
                &Value::Object(last.outputs.clone()),
                last.success,
                last.step_id,
            );
            evaluator.evaluate_bool(expression, &context).map_err(|e| {
                ExecutionError::new(
                    ErrorKind::InvalidConfiguration,
                    format!("edge {} -> {}: {e}", edge.source, edge.target),
                )
                .with_context("expression", expression.clone())
            })?
        }
        EdgeCondition::Decided { label } => {
            last.outputs.get("route").and_then(Value::as_str) == Some(label.as_str())
        }
    })
}

/// Plan steps whose dependencies have all completed, in declaration order.
pub fn ready_steps<'p>(
    plan: &'p Plan,
    completed: &HashSet<String>,
    failed: &HashSet<String>,
) -> Vec<&'p Step> {
    plan.steps
        .iter()
        .filter(|s| !completed.contains(&s.id) && !failed.contains(&s.id))
        .filter(|s| s.depends_on.iter().all(|d| completed.contains(d)))
        .collect()
}
