//! Run records and the decision/outcome audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Severity shared by problems and guardrail violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One end-to-end execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    /// The graph or plan ID this run executes.
    pub goal_id: String,
    pub description: String,
    pub input: Value,
    pub status: RunStatus,
    pub decisions: Vec<Decision>,
    pub problems: Vec<Problem>,
    pub metrics: RunMetrics,
    /// Human-readable summary written when the run ends.
    pub narrative: Option<String>,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn decision(&self, id: &str) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.id == id)
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }
}

/// An alternative weighed when making a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    pub confidence: f64,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, description: impl Into<String>, confidence: f64) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            pros: Vec::new(),
            cons: Vec::new(),
            confidence,
        }
    }
}

/// One audit entry: what was attempted, and why.
///
/// Immutable after creation apart from its single [`Outcome`] attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Dense, call-ordered ID (`dec_0`, `dec_1`, ...).
    pub id: String,
    pub node_id: Option<String>,
    pub intent: String,
    pub options: Vec<DecisionOption>,
    pub chosen: String,
    pub reasoning: String,
    /// Snapshot of the inputs the decision was made against.
    pub context: Value,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
}

/// The result of a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
    /// Memory keys written as a result of the decision.
    #[serde(default)]
    pub state_changes: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Something that went wrong during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    /// Dense, call-ordered ID (`prob_0`, `prob_1`, ...).
    pub id: String,
    pub severity: Severity,
    pub description: String,
    pub decision_id: Option<String>,
    pub root_cause: Option<String>,
    pub suggested_fix: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    pub nodes_visited: u64,
    pub decision_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub retries: u64,
}

impl RunMetrics {
    /// Successful outcomes over all recorded outcomes; 0.0 when none.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }
}
