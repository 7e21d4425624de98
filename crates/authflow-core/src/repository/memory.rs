//! In-memory implementation of every store trait.
//!
//! Cloning an `InMemoryStore` shares the underlying maps, so two engines built
//! over clones of one store see the same data. Tests use this to simulate a
//! process restart against surviving storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use authflow_types::error::RepositoryError;
use authflow_types::fanout::SubworkflowFanout;
use authflow_types::task::{HumanTask, TaskStatus};
use authflow_types::watch::AsyncWatch;
use authflow_types::workflow::{Checkpoint, InstanceStatus, WorkflowInstance};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::checkpoint::CheckpointStore;
use super::fanout::FanoutStore;
use super::task::TaskStore;
use super::watch::WatchStore;

#[derive(Default)]
struct Tables {
    checkpoints: HashMap<Uuid, BTreeMap<u32, Checkpoint>>,
    instances: HashMap<Uuid, WorkflowInstance>,
    tasks: HashMap<Uuid, HumanTask>,
    watches: HashMap<Uuid, AsyncWatch>,
    fanouts: HashMap<Uuid, SubworkflowFanout>,
}

/// Process-local store. Nothing survives the process.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
    /// When set, checkpoint and instance writes fail with `Connection`.
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make checkpoint and instance writes fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        self.tables
            .lock()
            .map_err(|_| RepositoryError::Query("store mutex poisoned".to_string()))
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

impl CheckpointStore for InMemoryStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut tables = self.lock()?;
        let history = tables.checkpoints.entry(checkpoint.instance_id).or_default();
        if let Some((&latest, _)) = history.last_key_value() {
            if checkpoint.step_count < latest {
                return Err(RepositoryError::Conflict(format!(
                    "checkpoint step {} is behind latest step {latest}",
                    checkpoint.step_count
                )));
            }
        }
        history.insert(checkpoint.step_count, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let tables = self.lock()?;
        Ok(tables
            .checkpoints
            .get(instance_id)
            .and_then(|h| h.last_key_value().map(|(_, cp)| cp.clone())))
    }

    async fn list_checkpoints(&self, instance_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let tables = self.lock()?;
        Ok(tables
            .checkpoints
            .get(instance_id)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut tables = self.lock()?;
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.lock()?.instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let tables = self.lock()?;
        let mut instances: Vec<WorkflowInstance> = tables
            .instances
            .values()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.created_at, i.id));
        Ok(instances)
    }
}

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

impl TaskStore for InMemoryStore {
    async fn insert_open_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        let mut tables = self.lock()?;
        let already_open = tables
            .tasks
            .values()
            .any(|t| t.instance_id == task.instance_id && t.status == TaskStatus::Open);
        if already_open {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already has an open task",
                task.instance_id
            )));
        }
        tables.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<HumanTask>, RepositoryError> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    async fn open_task_for_instance(
        &self,
        instance_id: &Uuid,
    ) -> Result<Option<HumanTask>, RepositoryError> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .find(|t| t.instance_id == *instance_id && t.status == TaskStatus::Open)
            .cloned())
    }

    async fn resolve_task(&self, id: &Uuid, resolution: &Value) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        match tables.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Open => {
                task.status = TaskStatus::Resolved;
                task.resolution = Some(resolution.clone());
                task.resolved_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn cancel_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut tables = self.lock()?;
        match tables.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Open => {
                task.status = TaskStatus::Cancelled;
                task.resolved_at = Some(Utc::now());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_open_tasks(&self) -> Result<Vec<HumanTask>, RepositoryError> {
        let tables = self.lock()?;
        let mut open: Vec<HumanTask> = tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|t| (t.created_at, t.id));
        Ok(open)
    }
}

// ---------------------------------------------------------------------------
// WatchStore
// ---------------------------------------------------------------------------

impl WatchStore for InMemoryStore {
    async fn upsert_watch(&self, watch: &AsyncWatch) -> Result<(), RepositoryError> {
        self.lock()?.watches.insert(watch.instance_id, watch.clone());
        Ok(())
    }

    async fn get_watch(&self, instance_id: &Uuid) -> Result<Option<AsyncWatch>, RepositoryError> {
        Ok(self.lock()?.watches.get(instance_id).cloned())
    }

    async fn due_watches(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AsyncWatch>, RepositoryError> {
        let tables = self.lock()?;
        let mut due: Vec<AsyncWatch> = tables
            .watches
            .values()
            .filter(|w| w.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|w| (w.next_poll_at, w.instance_id));
        due.truncate(limit);
        Ok(due)
    }

    async fn remove_watch(&self, instance_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.lock()?.watches.remove(instance_id).is_some())
    }

    async fn count_watches(&self) -> Result<usize, RepositoryError> {
        Ok(self.lock()?.watches.len())
    }
}

// ---------------------------------------------------------------------------
// FanoutStore
// ---------------------------------------------------------------------------

impl FanoutStore for InMemoryStore {
    async fn save_fanout(&self, fanout: &SubworkflowFanout) -> Result<(), RepositoryError> {
        self.lock()?.fanouts.insert(fanout.id, fanout.clone());
        Ok(())
    }

    async fn get_fanout(&self, id: &Uuid) -> Result<Option<SubworkflowFanout>, RepositoryError> {
        Ok(self.lock()?.fanouts.get(id).cloned())
    }

    async fn fanout_for_parent(
        &self,
        parent_instance_id: &Uuid,
    ) -> Result<Option<SubworkflowFanout>, RepositoryError> {
        Ok(self
            .lock()?
            .fanouts
            .values()
            .find(|f| f.parent_instance_id == *parent_instance_id)
            .cloned())
    }

    async fn delete_fanout(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.lock()?.fanouts.remove(id).is_some())
    }

    async fn list_fanouts(&self) -> Result<Vec<SubworkflowFanout>, RepositoryError> {
        let tables = self.lock()?;
        let mut fanouts: Vec<SubworkflowFanout> = tables.fanouts.values().cloned().collect();
        fanouts.sort_by_key(|f| (f.created_at, f.id));
        Ok(fanouts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use authflow_types::task::{MissingItem, TaskPayload, TaskRequest};
    use serde_json::json;

    fn task_for(instance_id: Uuid) -> HumanTask {
        HumanTask::open(
            instance_id,
            TaskRequest::new(
                "Upload chart notes",
                TaskPayload::RequireDocuments {
                    missing: vec![MissingItem {
                        name: "chart_notes".to_string(),
                        description: None,
                    }],
                },
            ),
        )
    }

    #[tokio::test]
    async fn test_load_returns_highest_step() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();
        for step in [0, 1, 2] {
            store
                .save_checkpoint(&Checkpoint::new(id, step, json!({"step": step}), None))
                .await
                .unwrap();
        }
        let latest = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.step_count, 2);
        assert_eq!(store.list_checkpoints(&id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_checkpoint_rejected() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();
        store
            .save_checkpoint(&Checkpoint::new(id, 5, json!({}), None))
            .await
            .unwrap();
        let err = store
            .save_checkpoint(&Checkpoint::new(id, 4, json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        // equal step replaces
        store
            .save_checkpoint(&Checkpoint::new(id, 5, json!({"v": 2}), None))
            .await
            .unwrap();
        let latest = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.state, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_unavailable_rejects_writes() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .save_checkpoint(&Checkpoint::new(Uuid::now_v7(), 0, json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
        store.set_unavailable(false);
        assert!(
            store
                .save_checkpoint(&Checkpoint::new(Uuid::now_v7(), 0, json!({}), None))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_one_open_task_per_instance() {
        let store = InMemoryStore::new();
        let instance = Uuid::now_v7();
        let first = task_for(instance);
        store.insert_open_task(&first).await.unwrap();

        let err = store.insert_open_task(&task_for(instance)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        assert!(store.resolve_task(&first.id, &json!({"ok": true})).await.unwrap());
        assert!(!store.resolve_task(&first.id, &json!({})).await.unwrap());
        store.insert_open_task(&task_for(instance)).await.unwrap();
    }

    #[tokio::test]
    async fn test_due_watches_ordering_and_removal() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let early = AsyncWatch::new(Uuid::now_v7(), "A", 2, 300, now - chrono::Duration::seconds(60));
        let late = AsyncWatch::new(Uuid::now_v7(), "B", 2, 300, now + chrono::Duration::seconds(60));
        store.upsert_watch(&late).await.unwrap();
        store.upsert_watch(&early).await.unwrap();

        let due = store.due_watches(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].resource_id, "A");

        assert!(store.remove_watch(&early.instance_id).await.unwrap());
        assert!(!store.remove_watch(&early.instance_id).await.unwrap());
        assert_eq!(store.count_watches().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryStore::new();
        let other = store.clone();
        let inst = WorkflowInstance::new("def", "start", json!({}));
        store.save_instance(&inst).await.unwrap();
        assert!(other.get_instance(&inst.id).await.unwrap().is_some());
        assert_eq!(
            other
                .list_instances(Some(InstanceStatus::Running))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(
            other
                .list_instances(Some(InstanceStatus::Paused))
                .await
                .unwrap()
                .is_empty()
        );
    }
}
