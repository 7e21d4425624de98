//! Human task gate.
//!
//! Owns the lifecycle of human tasks: at most one OPEN task per instance,
//! payloads validated against their task type, resolutions passed through
//! untouched. Pausing and resuming the owning instance is the executor's job.

use std::sync::Arc;

use authflow_types::error::RepositoryError;
use authflow_types::event::EngineEvent;
use authflow_types::task::{HumanTask, TaskRequest};
use serde_json::Value;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::task::TaskStore;

use super::error::EngineError;

pub struct TaskGate<S: TaskStore> {
    store: Arc<S>,
    events: EventBus,
}

impl<S: TaskStore> TaskGate<S> {
    pub fn new(store: Arc<S>, events: EventBus) -> Self {
        Self { store, events }
    }

    /// Open a task for `instance_id`.
    ///
    /// Fails with `TaskAlreadyOpen` if the instance already has an OPEN task.
    pub async fn create(
        &self,
        instance_id: Uuid,
        request: TaskRequest,
    ) -> Result<HumanTask, EngineError> {
        request.payload.validate()?;
        if request.title.trim().is_empty() {
            return Err(EngineError::Validation("task title must not be blank".to_string()));
        }
        if self.store.open_task_for_instance(&instance_id).await?.is_some() {
            return Err(EngineError::TaskAlreadyOpen(instance_id));
        }

        let task = HumanTask::open(instance_id, request);
        match self.store.insert_open_task(&task).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => return Err(EngineError::TaskAlreadyOpen(instance_id)),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            task_id = %task.id,
            instance_id = %instance_id,
            task_type = task.task_type.as_str(),
            priority = ?task.priority,
            "human task opened"
        );
        self.events.publish(EngineEvent::TaskOpened {
            task_id: task.id,
            instance_id,
            task_type: task.task_type,
        });
        Ok(task)
    }

    /// Return the instance's OPEN task, or open one from `request`.
    ///
    /// Used when re-applying a recorded suspension, where the task may already
    /// exist from before a crash.
    pub async fn open_or_adopt(
        &self,
        instance_id: Uuid,
        request: TaskRequest,
    ) -> Result<HumanTask, EngineError> {
        if let Some(existing) = self.store.open_task_for_instance(&instance_id).await? {
            tracing::debug!(
                task_id = %existing.id,
                instance_id = %instance_id,
                "adopting open task"
            );
            return Ok(existing);
        }
        self.create(instance_id, request).await
    }

    /// Mark an OPEN task RESOLVED. The resolution is stored as given.
    pub async fn resolve(&self, task_id: Uuid, resolution: Value) -> Result<HumanTask, EngineError> {
        let mut task = self.get(task_id).await?;
        if !task.is_open() {
            return Err(EngineError::TaskNotOpen(task_id));
        }
        if !self.store.resolve_task(&task_id, &resolution).await? {
            return Err(EngineError::TaskNotOpen(task_id));
        }

        // re-read for the stored resolution timestamp
        task = self.store.get_task(&task_id).await?.unwrap_or(task);
        tracing::info!(
            task_id = %task_id,
            instance_id = %task.instance_id,
            task_type = task.task_type.as_str(),
            "human task resolved"
        );
        self.events.publish(EngineEvent::TaskResolved {
            task_id,
            instance_id: task.instance_id,
        });
        Ok(task)
    }

    /// Cancel an OPEN task. Returns false if it was no longer open.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, EngineError> {
        match self.store.cancel_task(&task_id).await {
            Ok(cancelled) => {
                if cancelled {
                    tracing::info!(task_id = %task_id, "human task cancelled");
                }
                Ok(cancelled)
            }
            Err(RepositoryError::NotFound) => Err(EngineError::TaskNotFound(task_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, task_id: Uuid) -> Result<HumanTask, EngineError> {
        self.store
            .get_task(&task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// The instance's OPEN task, if any.
    pub async fn open_task(&self, instance_id: Uuid) -> Result<Option<HumanTask>, EngineError> {
        Ok(self.store.open_task_for_instance(&instance_id).await?)
    }

    /// Every OPEN task, oldest first.
    pub async fn list_open(&self) -> Result<Vec<HumanTask>, EngineError> {
        Ok(self.store.list_open_tasks().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStore;
    use authflow_types::task::{MissingItem, TaskPayload, TaskStatus, TaskType};
    use serde_json::json;

    fn gate() -> TaskGate<InMemoryStore> {
        TaskGate::new(Arc::new(InMemoryStore::new()), EventBus::default())
    }

    fn docs_request() -> TaskRequest {
        TaskRequest::new(
            "Upload clinical notes",
            TaskPayload::RequireDocuments {
                missing: vec![MissingItem {
                    name: "clinical_notes".to_string(),
                    description: None,
                }],
            },
        )
    }

    #[tokio::test]
    async fn test_second_open_task_rejected_until_resolved() {
        let gate = gate();
        let instance = Uuid::now_v7();

        let first = gate.create(instance, docs_request()).await.unwrap();
        assert_eq!(first.task_type, TaskType::RequireDocuments);

        let err = gate.create(instance, docs_request()).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskAlreadyOpen(id) if id == instance));
        assert!(!err.is_instance_fatal());

        let resolved = gate.resolve(first.id, json!({"uploaded": true})).await.unwrap();
        assert_eq!(resolved.status, TaskStatus::Resolved);
        assert_eq!(resolved.resolution, Some(json!({"uploaded": true})));

        let second = gate.create(instance, docs_request()).await.unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_resolve_twice_fails() {
        let gate = gate();
        let task = gate.create(Uuid::now_v7(), docs_request()).await.unwrap();
        gate.resolve(task.id, json!({})).await.unwrap();
        let err = gate.resolve(task.id, json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotOpen(_)));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let gate = gate();
        let err = gate.resolve(Uuid::now_v7(), json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
        assert!(matches!(
            gate.cancel(Uuid::now_v7()).await.unwrap_err(),
            EngineError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected() {
        let gate = gate();
        let request = TaskRequest::new(
            "Review",
            TaskPayload::AmbiguousResponse {
                summary: "unclear denial".to_string(),
                confidence: 1.7,
                recommended_action: None,
            },
        );
        let err = gate.create(Uuid::now_v7(), request).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(gate.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_or_adopt_reuses_open_task() {
        let gate = gate();
        let instance = Uuid::now_v7();
        let first = gate.open_or_adopt(instance, docs_request()).await.unwrap();
        let again = gate.open_or_adopt(instance, docs_request()).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(gate.list_open().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel() {
        let gate = gate();
        let instance = Uuid::now_v7();
        let task = gate.create(instance, docs_request()).await.unwrap();
        assert!(gate.cancel(task.id).await.unwrap());
        assert!(!gate.cancel(task.id).await.unwrap());
        assert!(gate.open_task(instance).await.unwrap().is_none());
        assert_eq!(gate.get(task.id).await.unwrap().status, TaskStatus::Cancelled);
    }
}
