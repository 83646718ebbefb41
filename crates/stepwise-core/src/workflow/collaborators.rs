//! External collaborators the worker and executor call out to.
//!
//! Implementations live outside the engine. Each trait is object-safe so
//! the executor can hold them as `Arc<dyn ...>`; faults cross the seam as
//! `anyhow::Error` and are classified on the engine side.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::workflow::Step;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Sub-workflows
// ---------------------------------------------------------------------------

/// A nested workflow invocation.
#[derive(Debug, Clone)]
pub struct SubWorkflowRequest {
    pub workflow_id: String,
    pub inputs: Map<String, Value>,
    /// Snapshot of the caller's shared memory.
    pub context: Value,
    /// Nesting depth of the nested run (the top-level run is depth 0).
    pub depth: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubWorkflowResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub total_tokens: u64,
}

pub trait SubWorkflowExecutor: Send + Sync {
    fn execute(&self, request: SubWorkflowRequest) -> BoxFuture<'_, anyhow::Result<SubWorkflowResult>>;
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    /// Variables left defined by the code.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: u64,
}

/// Runs untrusted code with the given inputs in scope.
pub trait Sandbox: Send + Sync {
    fn execute<'a>(
        &'a self,
        code: &'a str,
        language: Option<&'a str>,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, anyhow::Result<SandboxResult>>;
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Verdict,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            decision: Verdict::Approve,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            decision: Verdict::Reject,
            reason: Some(reason.into()),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.decision == Verdict::Approve
    }
}

/// Decides whether a step flagged `requires_approval` may run.
pub trait ApprovalGate: Send + Sync {
    fn review<'a>(&'a self, run_id: Uuid, step: &'a Step) -> BoxFuture<'a, anyhow::Result<ApprovalDecision>>;
}
