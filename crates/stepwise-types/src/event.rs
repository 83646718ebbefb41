//! Event types for the run event bus.
//!
//! `RunEvent` is broadcast during workflow execution. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guardrail::GuardrailAction;

/// Events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run has started.
    RunStarted { run_id: Uuid, goal_id: String },

    /// A step has been dispatched to the worker.
    StepStarted {
        run_id: Uuid,
        step_id: String,
        executor_type: String,
        attempt: u32,
    },

    /// A step produced a successful result.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
        tokens_used: u64,
    },

    /// A step failed.
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// A guardrail returned WARN or BLOCK.
    GuardrailTriggered {
        run_id: Uuid,
        step_id: String,
        policy_id: String,
        action: GuardrailAction,
    },

    /// A checkpoint was written.
    CheckpointSaved {
        run_id: Uuid,
        checkpoint_id: Uuid,
        node_id: String,
        step_counter: u64,
    },

    /// A run completed successfully.
    RunCompleted {
        run_id: Uuid,
        duration_ms: u64,
        steps_completed: u64,
    },

    /// A run failed.
    RunFailed {
        run_id: Uuid,
        error_kind: String,
        error: String,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::GuardrailTriggered { run_id, .. }
            | RunEvent::CheckpointSaved { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => *run_id,
        }
    }
}
