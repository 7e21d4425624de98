//! Human task store trait.

use authflow_types::error::RepositoryError;
use authflow_types::task::HumanTask;
use serde_json::Value;
use uuid::Uuid;

/// Storage for human tasks.
///
/// Implementations must enforce "at most one OPEN task per instance"
/// atomically: `insert_open_task` fails with `RepositoryError::Conflict` when
/// the instance already has one.
pub trait TaskStore: Send + Sync {
    fn insert_open_task(
        &self,
        task: &HumanTask,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<HumanTask>, RepositoryError>> + Send;

    /// The OPEN task of an instance, if any.
    fn open_task_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<HumanTask>, RepositoryError>> + Send;

    /// Move an OPEN task to RESOLVED and store its resolution.
    ///
    /// Returns `false` (and changes nothing) when the task is not OPEN.
    fn resolve_task(
        &self,
        id: &Uuid,
        resolution: &Value,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move an OPEN task to CANCELLED. Returns `false` when it was not OPEN.
    fn cancel_task(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// All OPEN tasks, oldest first.
    fn list_open_tasks(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<HumanTask>, RepositoryError>> + Send;
}
