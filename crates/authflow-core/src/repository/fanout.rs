//! Fan-out store trait.

use authflow_types::error::RepositoryError;
use authflow_types::fanout::SubworkflowFanout;
use uuid::Uuid;

/// Storage for in-flight fan-outs.
pub trait FanoutStore: Send + Sync {
    /// Insert or replace a fan-out record (including its aggregation state).
    fn save_fanout(
        &self,
        fanout: &SubworkflowFanout,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_fanout(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SubworkflowFanout>, RepositoryError>> + Send;

    /// The fan-out a parent instance is currently waiting on, if any.
    fn fanout_for_parent(
        &self,
        parent_instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SubworkflowFanout>, RepositoryError>> + Send;

    /// Delete a consumed fan-out. Returns `true` if it existed.
    fn delete_fanout(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_fanouts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<SubworkflowFanout>, RepositoryError>> + Send;
}
