//! Run and checkpoint storage trait definition.

use stepwise_types::checkpoint::{Checkpoint, CheckpointMetadata};
use stepwise_types::error::RepositoryError;
use stepwise_types::run::Run;
use uuid::Uuid;

/// Persistence backend for run records and their checkpoints.
///
/// Logical layout: one `Run` record per run ID, checkpoints namespaced
/// `by_run/{run_id}/{checkpoint_id}`. Implementations must return
/// checkpoint listings newest first.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunStorage: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Upsert a run record.
    fn save_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run record by ID.
    fn load_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Persist a checkpoint. Checkpoints are never updated in place.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get one checkpoint of a run.
    fn load_checkpoint(
        &self,
        run_id: &Uuid,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Get the checkpoint with the highest step counter (latest written on ties).
    fn load_latest_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// List a run's checkpoints, newest first.
    fn list_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointMetadata>, RepositoryError>> + Send;

    /// Delete the given checkpoints of a run, or all of them when `ids` is
    /// `None`. Returns how many were removed.
    fn delete_checkpoints(
        &self,
        run_id: &Uuid,
        ids: Option<&[Uuid]>,
    ) -> impl std::future::Future<Output = Result<usize, RepositoryError>> + Send;
}
