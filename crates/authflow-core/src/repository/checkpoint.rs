//! Checkpoint and instance store trait.

use authflow_types::error::RepositoryError;
use authflow_types::workflow::{Checkpoint, InstanceStatus, WorkflowInstance};
use uuid::Uuid;

/// Durable storage for instance records and their checkpoint history.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Persist a checkpoint.
    ///
    /// A checkpoint whose `step_count` is lower than the latest stored for the
    /// same instance is rejected with `RepositoryError::Conflict`. An equal
    /// `step_count` replaces the stored entry.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the checkpoint with the highest `step_count` for an instance.
    fn load_checkpoint(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of an instance, ordered by `step_count` ascending.
    fn list_checkpoints(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert or replace an instance record.
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances, optionally filtered by status, oldest first.
    fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}
