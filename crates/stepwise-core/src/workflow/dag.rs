//! Graph structure checks and plan wave computation.
//!
//! Uses `petgraph` for both modes. Graph-mode workflows may contain cycles
//! (loops are bounded at run time), so only reachability and terminal steps
//! are checked there. Plan-mode dependencies must form a DAG.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use stepwise_types::workflow::{Plan, Step, WorkflowGraph};

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// Graph mode
// ---------------------------------------------------------------------------

/// Step IDs and edges of a workflow graph as a petgraph `DiGraph`.
struct StepGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> StepGraph<'a> {
    fn build(workflow: &'a WorkflowGraph) -> Result<Self, DefinitionError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, NodeIndex> = workflow
            .steps
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        for edge in &workflow.edges {
            let from = index.get(edge.source.as_str()).ok_or_else(|| {
                DefinitionError::UnknownStep(format!(
                    "edge source '{}' is not a declared step",
                    edge.source
                ))
            })?;
            let to = index.get(edge.target.as_str()).ok_or_else(|| {
                DefinitionError::UnknownStep(format!(
                    "edge target '{}' is not a declared step",
                    edge.target
                ))
            })?;
            graph.add_edge(*from, *to, ());
        }
        Ok(Self { graph, index })
    }
}

/// Check edge references, the entry step, and terminal steps.
///
/// Steps unreachable from the entry are returned (and logged) rather than
/// rejected.
pub fn check_graph_structure(workflow: &WorkflowGraph) -> Result<Vec<String>, DefinitionError> {
    let steps = StepGraph::build(workflow)?;

    let entry = *steps.index.get(workflow.entry.as_str()).ok_or_else(|| {
        DefinitionError::Validation(format!(
            "entry step '{}' is not a declared step",
            workflow.entry
        ))
    })?;

    let has_terminal = steps
        .graph
        .node_indices()
        .any(|n| steps.graph.neighbors_directed(n, Direction::Outgoing).next().is_none());
    if !has_terminal {
        return Err(DefinitionError::Validation(
            "workflow graph has no terminal step".to_string(),
        ));
    }

    let mut reachable = vec![false; steps.graph.node_count()];
    let mut dfs = Dfs::new(&steps.graph, entry);
    while let Some(node) = dfs.next(&steps.graph) {
        reachable[node.index()] = true;
    }

    let unreachable: Vec<String> = steps
        .graph
        .node_indices()
        .filter(|n| !reachable[n.index()])
        .map(|n| steps.graph[n].to_string())
        .collect();
    for step_id in &unreachable {
        tracing::warn!(workflow_id = %workflow.id, step_id, "step is unreachable from the entry step");
    }
    Ok(unreachable)
}

// ---------------------------------------------------------------------------
// Plan mode
// ---------------------------------------------------------------------------

/// Group plan steps into waves: every step's dependencies lie in earlier waves.
///
/// Fails on unknown dependencies and on dependency cycles.
pub fn execution_waves(plan: &Plan) -> Result<Vec<Vec<&Step>>, DefinitionError> {
    let steps = &plan.steps;
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in steps {
        for dep in &step.depends_on {
            let from = index.get(dep.as_str()).ok_or_else(|| {
                DefinitionError::UnknownStep(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(*from, index[step.id.as_str()], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        DefinitionError::CycleDetected(format!(
            "dependency cycle involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node in sorted {
        let id = graph[node];
        let depth = by_id[id]
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(id, depth);
    }

    let wave_count = depths.values().copied().max().unwrap_or(0) + 1;
    let mut waves: Vec<Vec<&Step>> = vec![Vec::new(); wave_count];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }
    Ok(waves)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
