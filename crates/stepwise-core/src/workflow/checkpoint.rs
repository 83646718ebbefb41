//! Checkpoint store for crash-recoverable runs.
//!
//! Wraps `RunStorage` with the save-frequency and retention policies. A
//! checkpoint records where to resume (the next step), the shared memory,
//! the execution path and the run counters. Restoration always returns the
//! checkpoint with the highest step counter.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use stepwise_types::checkpoint::{Checkpoint, CheckpointConfig, CheckpointMetadata};
use uuid::Uuid;

use crate::repository::RunStorage;

// ---------------------------------------------------------------------------
// CheckpointState
// ---------------------------------------------------------------------------

/// Run progress captured alongside the memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    pub execution_path: Vec<String>,
    pub step_counter: u64,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Durable run snapshots under a frequency and retention policy.
///
/// Generic over `S: RunStorage` so it works with any storage backend.
pub struct CheckpointStore<S: RunStorage> {
    storage: Arc<S>,
    config: CheckpointConfig,
}

impl<S: RunStorage> CheckpointStore<S> {
    pub fn new(storage: Arc<S>, config: CheckpointConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Whether a save at `step_counter` would be written.
    pub fn is_due(&self, step_counter: u64) -> bool {
        self.config.enabled && self.config.frequency.is_due(step_counter)
    }

    /// Save a checkpoint if the frequency policy says one is due.
    ///
    /// Returns `None` when checkpointing is disabled or no save is due.
    /// Retention is applied after a successful write; pruning failures are
    /// logged and do not fail the save.
    pub async fn save(
        &self,
        run_id: Uuid,
        node_id: &str,
        memory: &Value,
        state: &CheckpointState,
    ) -> Result<Option<Uuid>, CheckpointError> {
        if !self.is_due(state.step_counter) {
            return Ok(None);
        }

        let checkpoint = Checkpoint {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.to_string(),
            memory: memory.clone(),
            execution_path: state.execution_path.clone(),
            step_counter: state.step_counter,
            completed_steps: state.completed_steps.clone(),
            failed_steps: state.failed_steps.clone(),
            total_tokens: state.total_tokens,
            total_latency_ms: state.total_latency_ms,
            created_at: Utc::now(),
        };

        self.storage
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            checkpoint_id = %checkpoint.id,
            node_id,
            step_counter = state.step_counter,
            "checkpoint saved"
        );

        self.apply_retention(run_id).await;
        Ok(Some(checkpoint.id))
    }

    async fn apply_retention(&self, run_id: Uuid) {
        let keep = self.config.retention.keep();
        let listed = match self.storage.list_checkpoints(&run_id).await {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "failed to list checkpoints for pruning");
                return;
            }
        };
        if listed.len() <= keep {
            return;
        }

        // Listing is newest first, so everything past `keep` is the oldest.
        let stale: Vec<Uuid> = listed.iter().skip(keep).map(|m| m.id).collect();
        match self.storage.delete_checkpoints(&run_id, Some(&stale)).await {
            Ok(pruned) => tracing::debug!(run_id = %run_id, pruned, "pruned old checkpoints"),
            Err(e) => tracing::warn!(run_id = %run_id, error = %e, "failed to prune checkpoints"),
        }
    }

    /// Memory snapshot and resume step of the latest checkpoint.
    pub async fn restore(&self, run_id: Uuid) -> Result<Option<(Value, String)>, CheckpointError> {
        Ok(self
            .restore_checkpoint(run_id)
            .await?
            .map(|cp| (cp.memory, cp.node_id)))
    }

    /// The full latest checkpoint, including path and counters.
    pub async fn restore_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoint = self
            .storage
            .load_latest_checkpoint(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        match &checkpoint {
            Some(cp) => tracing::debug!(
                run_id = %run_id,
                checkpoint_id = %cp.id,
                node_id = %cp.node_id,
                "restoring from checkpoint"
            ),
            None => tracing::debug!(run_id = %run_id, "no checkpoint to restore"),
        }
        Ok(checkpoint)
    }

    /// A run's checkpoints, newest first.
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<CheckpointMetadata>, CheckpointError> {
        self.storage
            .list_checkpoints(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Delete every checkpoint of a run. Returns how many were removed.
    pub async fn delete(&self, run_id: Uuid) -> Result<usize, CheckpointError> {
        let removed = self
            .storage
            .delete_checkpoints(&run_id, None)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id = %run_id, removed, "deleted checkpoints");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying storage operation failed.
    #[error("checkpoint storage error: {0}")]
    Repository(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
