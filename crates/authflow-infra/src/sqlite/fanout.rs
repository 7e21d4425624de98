//! SQLite fan-out store.
//!
//! Child ids and the per-index outcome map are JSON columns; the whole record
//! is rewritten on every save.

use std::collections::BTreeMap;

use authflow_core::repository::FanoutStore;
use authflow_types::error::RepositoryError;
use authflow_types::fanout::{ChildOutcome, SubworkflowFanout};
use sqlx::Row;
use uuid::Uuid;

use super::{SqliteEngineStore, format_datetime, from_json, parse_datetime, parse_uuid, query_err, to_json};

struct FanoutRow {
    id: String,
    parent_instance_id: String,
    node_id: String,
    child_definition_id: String,
    child_instance_ids: String,
    expected_count: i64,
    completed_count: i64,
    outcomes: String,
    created_at: String,
}

impl FanoutRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            parent_instance_id: row.try_get("parent_instance_id")?,
            node_id: row.try_get("node_id")?,
            child_definition_id: row.try_get("child_definition_id")?,
            child_instance_ids: row.try_get("child_instance_ids")?,
            expected_count: row.try_get("expected_count")?,
            completed_count: row.try_get("completed_count")?,
            outcomes: row.try_get("outcomes")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_fanout(self) -> Result<SubworkflowFanout, RepositoryError> {
        let count = |value: i64| {
            usize::try_from(value).map_err(|_| RepositoryError::Query(format!("invalid fan-out count: {value}")))
        };
        let outcomes: BTreeMap<usize, ChildOutcome> = from_json(&self.outcomes, "fan-out outcomes")?;
        Ok(SubworkflowFanout {
            id: parse_uuid(&self.id)?,
            parent_instance_id: parse_uuid(&self.parent_instance_id)?,
            node_id: self.node_id,
            child_definition_id: self.child_definition_id,
            child_instance_ids: from_json(&self.child_instance_ids, "child instance ids")?,
            expected_count: count(self.expected_count)?,
            completed_count: count(self.completed_count)?,
            outcomes,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const FANOUT_COLUMNS: &str = "id, parent_instance_id, node_id, child_definition_id, child_instance_ids, \
     expected_count, completed_count, outcomes, created_at";

fn count_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl SqliteEngineStore {
    async fn fetch_fanouts(&self, sql: &str, bind: Option<String>) -> Result<Vec<SubworkflowFanout>, RepositoryError> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_err)?;

        let mut fanouts = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = FanoutRow::from_row(row).map_err(query_err)?;
            fanouts.push(r.into_fanout()?);
        }
        Ok(fanouts)
    }
}

impl FanoutStore for SqliteEngineStore {
    async fn save_fanout(&self, fanout: &SubworkflowFanout) -> Result<(), RepositoryError> {
        let child_ids = to_json(&fanout.child_instance_ids, "child instance ids")?;
        let outcomes = to_json(&fanout.outcomes, "fan-out outcomes")?;

        sqlx::query(
            r#"INSERT INTO subworkflow_fanouts
               (id, parent_instance_id, node_id, child_definition_id, child_instance_ids,
                expected_count, completed_count, outcomes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 child_instance_ids = excluded.child_instance_ids,
                 expected_count = excluded.expected_count,
                 completed_count = excluded.completed_count,
                 outcomes = excluded.outcomes"#,
        )
        .bind(fanout.id.to_string())
        .bind(fanout.parent_instance_id.to_string())
        .bind(&fanout.node_id)
        .bind(&fanout.child_definition_id)
        .bind(&child_ids)
        .bind(count_to_i64(fanout.expected_count))
        .bind(count_to_i64(fanout.completed_count))
        .bind(&outcomes)
        .bind(format_datetime(&fanout.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_fanout(&self, id: &Uuid) -> Result<Option<SubworkflowFanout>, RepositoryError> {
        let sql = format!("SELECT {FANOUT_COLUMNS} FROM subworkflow_fanouts WHERE id = ?");
        Ok(self.fetch_fanouts(&sql, Some(id.to_string())).await?.pop())
    }

    async fn fanout_for_parent(&self, parent_instance_id: &Uuid) -> Result<Option<SubworkflowFanout>, RepositoryError> {
        let sql = format!(
            "SELECT {FANOUT_COLUMNS} FROM subworkflow_fanouts WHERE parent_instance_id = ? \
             ORDER BY created_at DESC LIMIT 1"
        );
        Ok(self
            .fetch_fanouts(&sql, Some(parent_instance_id.to_string()))
            .await?
            .pop())
    }

    async fn delete_fanout(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM subworkflow_fanouts WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_fanouts(&self) -> Result<Vec<SubworkflowFanout>, RepositoryError> {
        let sql = format!("SELECT {FANOUT_COLUMNS} FROM subworkflow_fanouts ORDER BY created_at ASC, id ASC");
        self.fetch_fanouts(&sql, None).await
    }
}
