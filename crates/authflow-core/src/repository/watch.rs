//! Async watch store trait.

use authflow_types::error::RepositoryError;
use authflow_types::watch::AsyncWatch;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Storage for registered status watches, keyed by instance id.
pub trait WatchStore: Send + Sync {
    /// Insert or replace the watch of `watch.instance_id`.
    fn upsert_watch(
        &self,
        watch: &AsyncWatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_watch(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<AsyncWatch>, RepositoryError>> + Send;

    /// Watches with `next_poll_at <= now`, earliest first, at most `limit`.
    fn due_watches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<AsyncWatch>, RepositoryError>> + Send;

    /// Remove a watch. Returns `true` only for the caller that removed it.
    fn remove_watch(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn count_watches(
        &self,
    ) -> impl std::future::Future<Output = Result<usize, RepositoryError>> + Send;
}
