//! Workflow definition types.
//!
//! A workflow is either a [`WorkflowGraph`] (steps joined by conditional
//! edges, one entry step, at least one terminal step) or a [`Plan`] (steps
//! joined by `depends_on` readiness). Both share the same immutable
//! [`Step`] shape; only step *results* change during a run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// The atomic unit of work dispatched by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step ID within its graph or plan (e.g. "fetch-news").
    pub id: String,
    /// Human-readable description; becomes the decision intent.
    #[serde(default)]
    pub description: String,
    /// What the step does.
    pub action: ActionSpec,
    /// Shared-memory keys this step reads. A missing key is a dependency error.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Shared-memory keys this step writes. Empty means "write every output".
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Extra inputs: literal values, or references into shared memory when a
    /// string starts with the reference marker (e.g. `"$topic"`).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    /// Plan mode only: steps that must complete successfully first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Retries allowed after the first attempt (falls back to the guardrail default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Maximum number of times the step may be dispatched in one run (graph loops).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_visits: Option<u32>,
    /// Step-level timeout in seconds (falls back to the executor default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Pause for an external approval decision before dispatch.
    #[serde(default)]
    pub requires_approval: bool,
    /// Token estimate used by the guardrail budget checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
}

impl Step {
    /// Build a step with defaults for everything but its ID and action.
    pub fn new(id: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            action,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            inputs: Map::new(),
            depends_on: Vec::new(),
            max_retries: None,
            max_visits: None,
            timeout_secs: None,
            requires_approval: false,
            estimated_tokens: None,
        }
    }

    /// Name of the tool this step invokes, if any.
    ///
    /// Function steps count as tool calls for guardrail purposes.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.action {
            ActionSpec::ToolUse { tool, .. } => Some(tool.as_str()),
            ActionSpec::Function { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Token estimate for guardrail budgeting.
    ///
    /// An explicit `estimated_tokens` wins; model calls otherwise estimate
    /// four characters per prompt token plus the requested output budget.
    pub fn token_estimate(&self) -> u64 {
        if let Some(estimate) = self.estimated_tokens {
            return estimate;
        }
        match &self.action {
            ActionSpec::ModelCall {
                prompt,
                system,
                max_tokens,
                ..
            } => {
                let chars = prompt.len() + system.as_ref().map_or(0, String::len);
                (chars as u64).div_ceil(4) + u64::from(max_tokens.unwrap_or(0))
            }
            _ => 0,
        }
    }
}

/// The kind of work a step performs.
///
/// Internally tagged by `kind`:
/// ```yaml
/// action:
///   kind: tool_use
///   tool: web_search
///   arguments: { query: "$topic" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Prompt a model; `{{ name }}` placeholders are filled from inputs.
    ModelCall {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        /// Tool names advertised to the model.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tools: Vec<String>,
    },
    /// Invoke a named tool with structured arguments.
    ToolUse {
        tool: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        arguments: Map<String, Value>,
    },
    /// Run another workflow by ID.
    SubWorkflow {
        workflow_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        inputs: Map<String, Value>,
    },
    /// Call a function registered by name.
    Function {
        name: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        arguments: Map<String, Value>,
    },
    /// Execute code in the sandbox collaborator.
    SandboxedCode {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

impl ActionSpec {
    /// Which executor kind handles this action.
    pub fn executor_type(&self) -> ExecutorType {
        match self {
            ActionSpec::ModelCall { .. } => ExecutorType::ModelCall,
            ActionSpec::ToolUse { .. } => ExecutorType::ToolUse,
            ActionSpec::SubWorkflow { .. } => ExecutorType::SubWorkflow,
            ActionSpec::Function { .. } => ExecutorType::Function,
            ActionSpec::SandboxedCode { .. } => ExecutorType::SandboxedCode,
        }
    }
}

/// Executor kind tag, reported on every step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorType {
    ModelCall,
    ToolUse,
    SubWorkflow,
    Function,
    SandboxedCode,
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutorType::ModelCall => "model_call",
            ExecutorType::ToolUse => "tool_use",
            ExecutorType::SubWorkflow => "sub_workflow",
            ExecutorType::Function => "function",
            ExecutorType::SandboxedCode => "sandboxed_code",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Graph mode
// ---------------------------------------------------------------------------

/// A directed connection between two graph steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Tie-break; lower values are evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Target key -> source key copies applied when the edge is taken.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input_mapping: HashMap<String, String>,
}

impl Edge {
    /// An unconditional edge with priority 0.
    pub fn new(source: impl Into<String>, target: impl Into<String>, condition: EdgeCondition) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition,
            priority: 0,
            input_mapping: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// When an edge is taken, relative to the last step result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    /// JEXL expression over `{ memory, outputs, success, step }`.
    Expression { expression: String },
    /// Taken when the step's `route` output equals `label`.
    Decided { label: String },
}

/// A workflow expressed as steps and conditional edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// ID of the single entry step.
    pub entry: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Outgoing edges of a step in ascending priority order (stable).
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.iter().filter(|e| e.source == id).collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }

    /// A terminal step has no outgoing edges.
    pub fn is_terminal(&self, id: &str) -> bool {
        !self.edges.iter().any(|e| e.source == id)
    }
}

// ---------------------------------------------------------------------------
// Plan mode
// ---------------------------------------------------------------------------

/// A workflow expressed as steps with dependency readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
