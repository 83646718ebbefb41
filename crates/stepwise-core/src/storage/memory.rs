//! In-memory `RunStorage` backed by `DashMap`.
//!
//! Used by tests and by embedders that do not need durability across
//! process restarts.

use dashmap::DashMap;
use stepwise_types::checkpoint::{Checkpoint, CheckpointMetadata};
use stepwise_types::error::RepositoryError;
use stepwise_types::run::Run;
use uuid::Uuid;

use crate::repository::RunStorage;

/// Process-local run and checkpoint store.
///
/// Checkpoints are kept per run in write order.
#[derive(Debug, Default)]
pub struct InMemoryRunStorage {
    runs: DashMap<Uuid, Run>,
    checkpoints: DashMap<Uuid, Vec<Checkpoint>>,
}

impl InMemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints currently held for a run.
    pub fn checkpoint_count(&self, run_id: &Uuid) -> usize {
        self.checkpoints.get(run_id).map_or(0, |v| v.len())
    }
}

impl RunStorage for InMemoryRunStorage {
    async fn save_run(&self, run: &Run) -> Result<(), RepositoryError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let mut entry = self.checkpoints.entry(checkpoint.run_id).or_default();
        if entry.iter().any(|c| c.id == checkpoint.id) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        entry.push(checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: &Uuid,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .get(run_id)
            .and_then(|v| v.iter().find(|c| c.id == *checkpoint_id).cloned()))
    }

    async fn load_latest_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        // max_by_key returns the last maximum, i.e. the latest write on ties.
        Ok(self
            .checkpoints
            .get(run_id)
            .and_then(|v| v.iter().max_by_key(|c| c.step_counter).cloned()))
    }

    async fn list_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<CheckpointMetadata>, RepositoryError> {
        let Some(entries) = self.checkpoints.get(run_id) else {
            return Ok(Vec::new());
        };
        let mut listed: Vec<CheckpointMetadata> =
            entries.iter().rev().map(Checkpoint::metadata).collect();
        // Stable sort keeps reverse write order among equal counters.
        listed.sort_by(|a, b| b.step_counter.cmp(&a.step_counter));
        Ok(listed)
    }

    async fn delete_checkpoints(
        &self,
        run_id: &Uuid,
        ids: Option<&[Uuid]>,
    ) -> Result<usize, RepositoryError> {
        match ids {
            None => Ok(self
                .checkpoints
                .remove(run_id)
                .map_or(0, |(_, removed)| removed.len())),
            Some(ids) => {
                let Some(mut entries) = self.checkpoints.get_mut(run_id) else {
                    return Ok(0);
                };
                let before = entries.len();
                entries.retain(|c| !ids.contains(&c.id));
                Ok(before - entries.len())
            }
        }
    }
}
