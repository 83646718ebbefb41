//! Checkpoint snapshots and the save/retention policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A durable, resumable snapshot of run progress.
///
/// Immutable once written; later checkpoints supersede earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Step to resume from.
    pub node_id: String,
    /// Serialized shared memory.
    pub memory: Value,
    pub execution_path: Vec<String>,
    pub step_counter: u64,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata {
            id: self.id,
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            step_counter: self.step_counter,
            path_len: self.execution_path.len(),
            created_at: self.created_at,
        }
    }
}

/// Listing view of a checkpoint, without the memory payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub step_counter: u64,
    pub path_len: usize,
    pub created_at: DateTime<Utc>,
}

/// When checkpoints are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SaveFrequency {
    EveryNode,
    EveryNNodes { n: u64 },
}

impl SaveFrequency {
    /// Whether a save is due at `step_counter`.
    pub fn is_due(&self, step_counter: u64) -> bool {
        match self {
            SaveFrequency::EveryNode => true,
            SaveFrequency::EveryNNodes { n } => {
                *n > 0 && step_counter > 0 && step_counter % n == 0
            }
        }
    }
}

/// How many checkpoints per run survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionPolicy {
    LatestOnly,
    PruneOld { keep: usize },
}

impl RetentionPolicy {
    /// Number of checkpoints kept per run.
    pub fn keep(&self) -> usize {
        match self {
            RetentionPolicy::LatestOnly => 1,
            RetentionPolicy::PruneOld { keep } => (*keep).max(1),
        }
    }
}

/// Checkpoint subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_frequency")]
    pub frequency: SaveFrequency,
    #[serde(default = "default_retention")]
    pub retention: RetentionPolicy,
}

fn default_enabled() -> bool {
    true
}

fn default_frequency() -> SaveFrequency {
    SaveFrequency::EveryNode
}

fn default_retention() -> RetentionPolicy {
    RetentionPolicy::PruneOld { keep: 5 }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            frequency: default_frequency(),
            retention: default_retention(),
        }
    }
}
