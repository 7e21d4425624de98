//! SQLite checkpoint and instance store.
//!
//! Checkpoints are append-only per step, except that re-saving the latest step
//! replaces it. Instances are a single upserted row each.

use authflow_core::repository::CheckpointStore;
use authflow_types::error::RepositoryError;
use authflow_types::workflow::{Blocker, Checkpoint, InstanceStatus, ParentLink, ResumeInput, Suspension, WorkflowInstance};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteEngineStore, format_datetime, from_json, opt_from_json, opt_to_json, parse_datetime, parse_uuid,
    query_err, to_json,
};

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    instance_id: String,
    step_count: i64,
    state: String,
    pending_node: Option<String>,
    suspension: Option<String>,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            step_count: row.try_get("step_count")?,
            state: row.try_get("state")?,
            pending_node: row.try_get("pending_node")?,
            suspension: row.try_get("suspension")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            instance_id: parse_uuid(&self.instance_id)?,
            step_count: u32::try_from(self.step_count)
                .map_err(|_| RepositoryError::Query(format!("invalid step count: {}", self.step_count)))?,
            state: from_json(&self.state, "checkpoint state")?,
            pending_node: self.pending_node,
            suspension: opt_from_json::<Suspension>(self.suspension.as_deref(), "suspension")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct InstanceRow {
    id: String,
    definition_id: String,
    intake_id: Option<String>,
    current_node: Option<String>,
    state: String,
    status: String,
    step_count: i64,
    blocker: Option<String>,
    resume_input: Option<String>,
    parent: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            intake_id: row.try_get("intake_id")?,
            current_node: row.try_get("current_node")?,
            state: row.try_get("state")?,
            status: row.try_get("status")?,
            step_count: row.try_get("step_count")?,
            blocker: row.try_get("blocker")?,
            resume_input: row.try_get("resume_input")?,
            parent: row.try_get("parent")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: InstanceStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid instance status: {}", self.status)))?;
        Ok(WorkflowInstance {
            id: parse_uuid(&self.id)?,
            definition_id: self.definition_id,
            intake_id: self.intake_id,
            current_node: self.current_node,
            state: from_json(&self.state, "instance state")?,
            status,
            step_count: u32::try_from(self.step_count)
                .map_err(|_| RepositoryError::Query(format!("invalid step count: {}", self.step_count)))?,
            blocker: opt_from_json::<Blocker>(self.blocker.as_deref(), "blocker")?,
            resume_input: opt_from_json::<ResumeInput>(self.resume_input.as_deref(), "resume input")?,
            parent: opt_from_json::<ParentLink>(self.parent.as_deref(), "parent link")?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

const INSTANCE_COLUMNS: &str = "id, definition_id, intake_id, current_node, state, status, step_count, \
     blocker, resume_input, parent, error, created_at, updated_at, completed_at";

const CHECKPOINT_COLUMNS: &str = "instance_id, step_count, state, pending_node, suspension, created_at";

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteEngineStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let state = to_json(&checkpoint.state, "checkpoint state")?;
        let suspension = opt_to_json(checkpoint.suspension.as_ref(), "suspension")?;
        let instance_id = checkpoint.instance_id.to_string();

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(step_count) FROM checkpoints WHERE instance_id = ?")
            .bind(&instance_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?;
        if let Some(latest) = latest {
            if i64::from(checkpoint.step_count) < latest {
                return Err(RepositoryError::Conflict(format!(
                    "checkpoint step {} is behind latest step {latest}",
                    checkpoint.step_count
                )));
            }
        }

        sqlx::query(
            r#"INSERT INTO checkpoints (instance_id, step_count, state, pending_node, suspension, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_count) DO UPDATE SET
                 state = excluded.state,
                 pending_node = excluded.pending_node,
                 suspension = excluded.suspension,
                 created_at = excluded.created_at"#,
        )
        .bind(&instance_id)
        .bind(i64::from(checkpoint.step_count))
        .bind(&state)
        .bind(&checkpoint.pending_node)
        .bind(&suspension)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn load_checkpoint(&self, instance_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE instance_id = ? ORDER BY step_count DESC LIMIT 1"
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, instance_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE instance_id = ? ORDER BY step_count ASC"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = CheckpointRow::from_row(row).map_err(query_err)?;
            checkpoints.push(r.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let state = to_json(&instance.state, "instance state")?;
        let blocker = opt_to_json(instance.blocker.as_ref(), "blocker")?;
        let resume_input = opt_to_json(instance.resume_input.as_ref(), "resume input")?;
        let parent = opt_to_json(instance.parent.as_ref(), "parent link")?;

        sqlx::query(
            r#"INSERT INTO workflow_instances
               (id, definition_id, intake_id, current_node, state, status, step_count, blocker,
                resume_input, parent_instance_id, parent, error, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 current_node = excluded.current_node,
                 state = excluded.state,
                 status = excluded.status,
                 step_count = excluded.step_count,
                 blocker = excluded.blocker,
                 resume_input = excluded.resume_input,
                 error = excluded.error,
                 updated_at = excluded.updated_at,
                 completed_at = excluded.completed_at"#,
        )
        .bind(instance.id.to_string())
        .bind(&instance.definition_id)
        .bind(&instance.intake_id)
        .bind(&instance.current_node)
        .bind(&state)
        .bind(instance.status.as_str())
        .bind(i64::from(instance.step_count))
        .bind(&blocker)
        .bind(&resume_input)
        .bind(instance.parent.map(|p| p.parent_instance_id.to_string()))
        .bind(&parent)
        .bind(&instance.error)
        .bind(format_datetime(&instance.created_at))
        .bind(format_datetime(&instance.updated_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = InstanceRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_instance()?))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(&self, status: Option<InstanceStatus>) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE status = ? ORDER BY created_at ASC, id ASC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INSTANCE_COLUMNS} FROM workflow_instances ORDER BY created_at ASC, id ASC"
                ))
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = InstanceRow::from_row(row).map_err(query_err)?;
            instances.push(r.into_instance()?);
        }
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::testing::store;
    use authflow_types::task::{MissingItem, TaskPayload, TaskRequest};
    use authflow_types::workflow::Blocker;
    use serde_json::json;

    #[tokio::test]
    async fn test_checkpoint_history_and_latest() {
        let (_dir, store) = store().await;
        let id = Uuid::now_v7();
        for step in 0..3u32 {
            store
                .save_checkpoint(&Checkpoint::new(id, step, json!({"n": step}), Some(format!("node{step}"))))
                .await
                .unwrap();
        }

        let latest = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.step_count, 2);
        assert_eq!(latest.state, json!({"n": 2}));
        assert_eq!(latest.pending_node.as_deref(), Some("node2"));

        let steps: Vec<u32> = store
            .list_checkpoints(&id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.step_count)
            .collect();
        assert_eq!(steps, vec![0, 1, 2]);
        assert!(store.load_checkpoint(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_conflicts_and_equal_replaces() {
        let (_dir, store) = store().await;
        let id = Uuid::now_v7();
        store
            .save_checkpoint(&Checkpoint::new(id, 5, json!({"v": 1}), Some("b".to_string())))
            .await
            .unwrap();

        let err = store
            .save_checkpoint(&Checkpoint::new(id, 4, json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        let suspension = Suspension::Watch {
            resource_id: "SUB-1".to_string(),
        };
        store
            .save_checkpoint(&Checkpoint::new(id, 5, json!({"v": 2}), Some("b".to_string())).with_suspension(suspension.clone()))
            .await
            .unwrap();
        let latest = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.state, json!({"v": 2}));
        assert_eq!(latest.suspension, Some(suspension));
        assert_eq!(store.list_checkpoints(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_suspension_with_task_request_round_trips() {
        let (_dir, store) = store().await;
        let id = Uuid::now_v7();
        let suspension = Suspension::HumanTask {
            request: TaskRequest::new(
                "Upload chart notes",
                TaskPayload::RequireDocuments {
                    missing: vec![MissingItem {
                        name: "chart_notes".to_string(),
                        description: Some("last 90 days".to_string()),
                    }],
                },
            ),
        };
        let checkpoint = Checkpoint::new(id, 1, json!({"stage": "requirements"}), Some("assemble".to_string()))
            .with_suspension(suspension);
        store.save_checkpoint(&checkpoint).await.unwrap();

        let loaded = store.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_instance_upsert_and_status_filter() {
        let (_dir, store) = store().await;

        let mut paused = WorkflowInstance::new("prior_auth", "coverage", json!({"n": 1}));
        paused.intake_id = Some("INT-1".to_string());
        store.save_instance(&paused).await.unwrap();

        let done = WorkflowInstance::new("prior_auth", "coverage", json!({"n": 2}));
        store.save_instance(&done).await.unwrap();

        paused.step_count = 3;
        paused.current_node = Some("assemble".to_string());
        paused.blocker = Some(Blocker::Watch {
            resource_id: "SUB-9".to_string(),
        });
        paused.transition(InstanceStatus::Paused);
        store.save_instance(&paused).await.unwrap();

        let mut done = done;
        done.transition(InstanceStatus::Completed);
        store.save_instance(&done).await.unwrap();

        let loaded = store.get_instance(&paused.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Paused);
        assert_eq!(loaded.step_count, 3);
        assert_eq!(loaded.intake_id.as_deref(), Some("INT-1"));
        assert_eq!(loaded.blocker, paused.blocker);
        assert_eq!(loaded.updated_at, paused.updated_at);

        let all = store.list_instances(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, paused.id);

        let completed = store.list_instances(Some(InstanceStatus::Completed)).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);
        assert!(completed[0].completed_at.is_some());

        assert!(store.get_instance(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_child_instance_keeps_parent_link() {
        let (_dir, store) = store().await;
        let mut child = WorkflowInstance::new("gather_item", "fetch", json!({}));
        child.parent = Some(ParentLink {
            parent_instance_id: Uuid::now_v7(),
            fanout_id: Uuid::now_v7(),
            index: 2,
        });
        store.save_instance(&child).await.unwrap();

        let loaded = store.get_instance(&child.id).await.unwrap().unwrap();
        assert_eq!(loaded.parent, child.parent);
    }
}
