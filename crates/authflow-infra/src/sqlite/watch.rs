//! SQLite async watch store.

use authflow_core::repository::WatchStore;
use authflow_types::error::RepositoryError;
use authflow_types::watch::AsyncWatch;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{
    SqliteEngineStore, format_datetime, opt_from_json, opt_to_json, parse_datetime, parse_uuid, query_err,
};

struct WatchRow {
    instance_id: String,
    resource_id: String,
    next_poll_at: String,
    attempt: i64,
    backoff_base_secs: i64,
    max_interval_secs: i64,
    last_status: Option<String>,
    created_at: String,
}

impl WatchRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            resource_id: row.try_get("resource_id")?,
            next_poll_at: row.try_get("next_poll_at")?,
            attempt: row.try_get("attempt")?,
            backoff_base_secs: row.try_get("backoff_base_secs")?,
            max_interval_secs: row.try_get("max_interval_secs")?,
            last_status: row.try_get("last_status")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_watch(self) -> Result<AsyncWatch, RepositoryError> {
        let number = |value: i64, field: &str| {
            RepositoryError::Query(format!("invalid {field}: {value}"))
        };
        Ok(AsyncWatch {
            instance_id: parse_uuid(&self.instance_id)?,
            resource_id: self.resource_id,
            next_poll_at: parse_datetime(&self.next_poll_at)?,
            attempt: u32::try_from(self.attempt).map_err(|_| number(self.attempt, "attempt"))?,
            backoff_base_secs: u64::try_from(self.backoff_base_secs)
                .map_err(|_| number(self.backoff_base_secs, "backoff base"))?,
            max_interval_secs: u64::try_from(self.max_interval_secs)
                .map_err(|_| number(self.max_interval_secs, "max interval"))?,
            last_status: opt_from_json(self.last_status.as_deref(), "last status")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

const WATCH_COLUMNS: &str =
    "instance_id, resource_id, next_poll_at, attempt, backoff_base_secs, max_interval_secs, last_status, created_at";

fn to_i64(value: u64, field: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::Query(format!("{field} out of range: {value}")))
}

impl WatchStore for SqliteEngineStore {
    async fn upsert_watch(&self, watch: &AsyncWatch) -> Result<(), RepositoryError> {
        let last_status = opt_to_json(watch.last_status.as_ref(), "last status")?;
        sqlx::query(
            r#"INSERT INTO async_watches
               (instance_id, resource_id, next_poll_at, attempt, backoff_base_secs,
                max_interval_secs, last_status, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 resource_id = excluded.resource_id,
                 next_poll_at = excluded.next_poll_at,
                 attempt = excluded.attempt,
                 backoff_base_secs = excluded.backoff_base_secs,
                 max_interval_secs = excluded.max_interval_secs,
                 last_status = excluded.last_status"#,
        )
        .bind(watch.instance_id.to_string())
        .bind(&watch.resource_id)
        .bind(format_datetime(&watch.next_poll_at))
        .bind(i64::from(watch.attempt))
        .bind(to_i64(watch.backoff_base_secs, "backoff base")?)
        .bind(to_i64(watch.max_interval_secs, "max interval")?)
        .bind(&last_status)
        .bind(format_datetime(&watch.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn get_watch(&self, instance_id: &Uuid) -> Result<Option<AsyncWatch>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {WATCH_COLUMNS} FROM async_watches WHERE instance_id = ?"))
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let r = WatchRow::from_row(&row).map_err(query_err)?;
                Ok(Some(r.into_watch()?))
            }
            None => Ok(None),
        }
    }

    async fn due_watches(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AsyncWatch>, RepositoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {WATCH_COLUMNS} FROM async_watches WHERE next_poll_at <= ? \
             ORDER BY next_poll_at ASC, instance_id ASC LIMIT ?"
        ))
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut watches = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = WatchRow::from_row(row).map_err(query_err)?;
            watches.push(r.into_watch()?);
        }
        Ok(watches)
    }

    async fn remove_watch(&self, instance_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM async_watches WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_watches(&self) -> Result<usize, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM async_watches")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::testing::store;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_get_and_reschedule() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let mut watch = AsyncWatch::new(Uuid::now_v7(), "SUB-1", 2, 300, now);
        store.upsert_watch(&watch).await.unwrap();
        assert_eq!(store.get_watch(&watch.instance_id).await.unwrap(), Some(watch.clone()));

        watch.reschedule(watch.next_poll_at, Some(json!({"status": "pending"})));
        store.upsert_watch(&watch).await.unwrap();

        let loaded = store.get_watch(&watch.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.attempt, 1);
        assert_eq!(loaded.next_poll_at, now + Duration::seconds(6));
        assert_eq!(loaded.last_status, Some(json!({"status": "pending"})));
        assert_eq!(store.count_watches().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_watches_ordered_and_limited() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let soon = AsyncWatch::new(Uuid::now_v7(), "SUB-A", 2, 300, now - Duration::seconds(10));
        let sooner = AsyncWatch::new(Uuid::now_v7(), "SUB-B", 2, 300, now - Duration::seconds(60));
        let later = AsyncWatch::new(Uuid::now_v7(), "SUB-C", 2, 300, now + Duration::seconds(60));
        for w in [&soon, &sooner, &later] {
            store.upsert_watch(w).await.unwrap();
        }

        let due: Vec<String> = store
            .due_watches(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.resource_id)
            .collect();
        assert_eq!(due, vec!["SUB-B", "SUB-A"]);

        assert_eq!(store.due_watches(now, 1).await.unwrap().len(), 1);
        assert!(store.due_watches(now - Duration::hours(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_reports_first_remover_only() {
        let (_dir, store) = store().await;
        let watch = AsyncWatch::new(Uuid::now_v7(), "SUB-1", 2, 300, Utc::now());
        store.upsert_watch(&watch).await.unwrap();

        assert!(store.remove_watch(&watch.instance_id).await.unwrap());
        assert!(!store.remove_watch(&watch.instance_id).await.unwrap());
        assert!(store.get_watch(&watch.instance_id).await.unwrap().is_none());
        assert_eq!(store.count_watches().await.unwrap(), 0);
    }
}
