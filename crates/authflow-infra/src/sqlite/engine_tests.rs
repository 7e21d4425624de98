//! Engine runs against the SQLite store, including a restart in between.

use authflow_core::repository::{CheckpointStore, TaskStore};
use authflow_core::workflow::reasoning::{BoxReasoning, ReasoningCapability, ReasoningError};
use authflow_core::workflow::tool::{BoxToolInvoker, ToolError, ToolInvoker};
use authflow_core::workflow::{AsyncEventBridge, EngineServices, NodeContext, Transition, WorkflowEngine, handler_fn};
use authflow_types::config::EngineConfig;
use authflow_types::task::{MissingItem, TaskPayload, TaskRequest, TaskType};
use authflow_types::workflow::InstanceStatus;
use chrono::Utc;
use serde_json::{Value, json};

use super::SqliteEngineStore;
use super::pool::DatabasePool;

/// Status tool that always reports an approval.
struct ApprovingPayer;

impl ToolInvoker for ApprovingPayer {
    async fn invoke(&self, tool: &str, _args: &Value, _idempotency_key: Option<&str>) -> Result<Value, ToolError> {
        match tool {
            "check_status" => Ok(json!({"status": "approved"})),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

struct NoReasoning;

impl ReasoningCapability for NoReasoning {
    async fn reason(&self, _prompt: &str, _schema: &Value) -> Result<Value, ReasoningError> {
        Err(ReasoningError::Unavailable("not configured".to_string()))
    }
}

fn engine(pool: DatabasePool) -> WorkflowEngine<SqliteEngineStore, Value> {
    let services = EngineServices::new(BoxToolInvoker::new(ApprovingPayer), BoxReasoning::new(NoReasoning));
    let engine = WorkflowEngine::new(SqliteEngineStore::new(pool), EngineConfig::default(), services).unwrap();

    let collect = handler_fn(|mut state: Value, ctx: NodeContext| async move {
        if let Some((TaskType::RequireDocuments, resolution)) = ctx.task_resolution() {
            state["documents"] = resolution["uploaded"].clone();
            return Ok(Transition::next(state));
        }
        let request = TaskRequest::new(
            "Upload chart notes",
            TaskPayload::RequireDocuments {
                missing: vec![MissingItem {
                    name: "chart_notes".to_string(),
                    description: None,
                }],
            },
        );
        Ok(Transition::pause(state, request))
    });
    let await_payer = handler_fn(|mut state: Value, ctx: NodeContext| async move {
        match ctx.watch_status() {
            Some(status) => {
                state["payer_status"] = status["status"].clone();
                Ok(Transition::Complete(state))
            }
            None => Ok(Transition::watch(state, "SUB-1")),
        }
    });
    let definition = engine
        .builder("documents", "collect")
        .pause_node("collect", collect)
        .pause_node("await_payer", await_payer)
        .edge("collect", "await_payer")
        .end("await_payer")
        .build()
        .unwrap();
    engine.register(definition).unwrap();
    engine
}

#[tokio::test]
async fn test_paused_instance_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = DatabasePool::open_in(dir.path()).await.unwrap();
    let before = engine(first.clone());
    let report = before.launch("INT-1", "documents", json!({})).await.unwrap();
    assert_eq!(report.status, InstanceStatus::Paused);
    assert!(report.durable);
    let id = report.instance_id;
    let task = before.open_task(id).await.unwrap().unwrap();
    drop(before);
    first.close().await;

    // fresh process over the same database file
    let pool = DatabasePool::open_in(dir.path()).await.unwrap();
    let after = engine(pool.clone());
    let recovery = after.recover().await.unwrap();
    assert!(recovery.failed.is_empty());
    assert_eq!(after.describe(id).await.unwrap().status, InstanceStatus::Paused);

    let status = after
        .resolve_task(task.id, json!({"uploaded": ["chart_notes"]}))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Paused);

    let bridge = AsyncEventBridge::new(after.clone());
    let pass = bridge.poll_due(Utc::now() + chrono::Duration::hours(1)).await.unwrap();
    assert_eq!(pass.changed, 1);

    let described = after.describe(id).await.unwrap();
    assert_eq!(described.status, InstanceStatus::Completed);
    assert_eq!(
        after.state(id).await.unwrap(),
        json!({"documents": ["chart_notes"], "payer_status": "approved"})
    );

    let store = SqliteEngineStore::new(pool);
    let steps: Vec<u32> = store
        .list_checkpoints(&id)
        .await
        .unwrap()
        .iter()
        .map(|c| c.step_count)
        .collect();
    assert_eq!(steps.first(), Some(&0));
    assert_eq!(steps.last(), Some(&described.step_count));
    assert!(store.list_open_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolution_stored_before_crash_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let pool = DatabasePool::open_in(dir.path()).await.unwrap();

    let before = engine(pool.clone());
    let id = before.launch("INT-2", "documents", json!({})).await.unwrap().instance_id;
    let task = before.open_task(id).await.unwrap().unwrap();
    drop(before);

    // the reviewer's answer reached the database, the resume did not
    let store = SqliteEngineStore::new(pool.clone());
    assert!(store.resolve_task(&task.id, &json!({"uploaded": ["imaging"]})).await.unwrap());

    let after = engine(pool);
    let recovery = after.recover().await.unwrap();
    assert_eq!(recovery.tasks_delivered, 1);

    let described = after.describe(id).await.unwrap();
    assert_eq!(described.status, InstanceStatus::Paused);
    assert_eq!(described.current_node.as_deref(), Some("await_payer"));
    assert_eq!(after.state(id).await.unwrap()["documents"], json!(["imaging"]));
}
