//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! guardrail policies, checkpointing, and executor limits.

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointConfig;
use crate::guardrail::GuardrailConfig;

/// Top-level configuration for the execution engine.
///
/// All fields have sensible defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub guardrails: GuardrailConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Limits applied by the executor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default per-step timeout, used when a step sets none.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Wall-clock deadline for a whole run.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    /// Dispatch cap per run; bounds graph loops.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Prefix that marks a string input as a shared-memory reference.
    #[serde(default = "default_reference_marker")]
    pub reference_marker: String,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_steps() -> u64 {
    1000
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_reference_marker() -> String {
    "$".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            run_timeout_secs: None,
            max_steps: default_max_steps(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            reference_marker: default_reference_marker(),
        }
    }
}
