//! SQLite human task store.
//!
//! The "one OPEN task per instance" rule is a partial unique index, so two
//! racing inserts cannot both succeed.

use authflow_core::repository::TaskStore;
use authflow_types::error::RepositoryError;
use authflow_types::task::{HumanTask, TaskPayload, TaskPriority, TaskStatus, TaskType};
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteEngineStore, format_datetime, from_json, is_unique_violation, opt_from_json, parse_datetime, parse_uuid,
    query_err, to_json,
};

struct TaskRow {
    id: String,
    instance_id: String,
    task_type: String,
    title: String,
    payload: String,
    priority: String,
    assigned_to: Option<String>,
    status: String,
    resolution: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            task_type: row.try_get("task_type")?,
            title: row.try_get("title")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            assigned_to: row.try_get("assigned_to")?,
            status: row.try_get("status")?,
            resolution: row.try_get("resolution")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn into_task(self) -> Result<HumanTask, RepositoryError> {
        let task_type: TaskType = self.task_type.parse().map_err(RepositoryError::Query)?;
        let status: TaskStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let priority: TaskPriority = serde_json::from_value(Value::String(self.priority.clone()))
            .map_err(|_| RepositoryError::Query(format!("invalid task priority: {}", self.priority)))?;
        let payload: TaskPayload = from_json(&self.payload, "task payload")?;

        Ok(HumanTask {
            id: parse_uuid(&self.id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            task_type,
            title: self.title,
            payload,
            priority,
            assigned_to: self.assigned_to,
            status,
            resolution: opt_from_json(self.resolution.as_deref(), "task resolution")?,
            created_at: parse_datetime(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

const TASK_COLUMNS: &str =
    "id, instance_id, task_type, title, payload, priority, assigned_to, status, resolution, created_at, resolved_at";

fn priority_str(priority: TaskPriority) -> Result<String, RepositoryError> {
    serde_json::to_value(priority)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Query("task priority did not serialize to a string".to_string()))
}

impl SqliteEngineStore {
    /// Move an OPEN task to `status`. `Ok(false)` when the task exists but is
    /// no longer OPEN; `NotFound` when it does not exist.
    async fn close_task(
        &self,
        id: &Uuid,
        status: TaskStatus,
        resolution: Option<&Value>,
    ) -> Result<bool, RepositoryError> {
        let resolution = resolution.map(|r| to_json(r, "task resolution")).transpose()?;
        let result = sqlx::query(
            "UPDATE human_tasks SET status = ?, resolution = ?, resolved_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(status.as_str())
        .bind(&resolution)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM human_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }
}

impl TaskStore for SqliteEngineStore {
    async fn insert_open_task(&self, task: &HumanTask) -> Result<(), RepositoryError> {
        let payload = to_json(&task.payload, "task payload")?;
        let resolution = task
            .resolution
            .as_ref()
            .map(|r| to_json(r, "task resolution"))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO human_tasks
               (id, instance_id, task_type, title, payload, priority, assigned_to, status,
                resolution, created_at, resolved_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.instance_id.to_string())
        .bind(task.task_type.as_str())
        .bind(&task.title)
        .bind(&payload)
        .bind(priority_str(task.priority)?)
        .bind(&task.assigned_to)
        .bind(task.status.as_str())
        .bind(&resolution)
        .bind(format_datetime(&task.created_at))
        .bind(task.resolved_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("instance {} already has an open task", task.instance_id))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<HumanTask>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM human_tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn open_task_for_instance(&self, instance_id: &Uuid) -> Result<Option<HumanTask>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM human_tasks WHERE instance_id = ? AND status = 'open'"
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = TaskRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_task()?))
            }
            None => Ok(None),
        }
    }

    async fn resolve_task(&self, id: &Uuid, resolution: &Value) -> Result<bool, RepositoryError> {
        self.close_task(id, TaskStatus::Resolved, Some(resolution)).await
    }

    async fn cancel_task(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        self.close_task(id, TaskStatus::Cancelled, None).await
    }

    async fn list_open_tasks(&self) -> Result<Vec<HumanTask>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM human_tasks WHERE status = 'open' ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TaskRow::from_row(row).map_err(query_err)?;
            tasks.push(r.into_task()?);
        }
        Ok(tasks)
    }
}
