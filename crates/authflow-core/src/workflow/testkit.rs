//! Scripted collaborators and helpers for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use authflow_types::config::EngineConfig;
use authflow_types::payload::WorkflowState;
use authflow_types::workflow::InstanceStatus;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::memory::InMemoryStore;

use super::executor::{EngineServices, InstanceReport, WorkflowEngine};
use super::reasoning::{BoxReasoning, ReasoningCapability, ReasoningError};
use super::tool::{BoxToolInvoker, ToolError, ToolInvoker};

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ToolScript {
    keyed: Vec<(String, String, Value, Result<Value, ToolError>)>,
    queued: HashMap<String, VecDeque<Result<Value, ToolError>>>,
    fallback: HashMap<String, Value>,
    calls: Vec<(String, Value, Option<String>)>,
}

/// Tool invoker answering from queued responses, then a per-tool fallback.
/// Clones share the script and the call log.
#[derive(Clone, Default)]
pub(crate) struct ScriptedTools {
    script: Arc<Mutex<ToolScript>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `tool` with `value` once the queue is empty.
    pub fn respond(&self, tool: &str, value: Value) -> &Self {
        self.script.lock().unwrap().fallback.insert(tool.to_string(), value);
        self
    }

    /// Queue one response for the next call to `tool`.
    pub fn push(&self, tool: &str, response: Result<Value, ToolError>) -> &Self {
        self.script
            .lock()
            .unwrap()
            .queued
            .entry(tool.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Answer calls to `tool` whose `field` argument equals `value`, ahead of
    /// the queue and the fallback.
    pub fn respond_when(&self, tool: &str, field: &str, value: Value, response: Result<Value, ToolError>) -> &Self {
        self.script
            .lock()
            .unwrap()
            .keyed
            .push((tool.to_string(), field.to_string(), value, response));
        self
    }

    pub fn calls(&self, tool: &str) -> Vec<(Value, Option<String>)> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(t, _, _)| t == tool)
            .map(|(_, args, key)| (args.clone(), key.clone()))
            .collect()
    }
}

impl ToolInvoker for ScriptedTools {
    async fn invoke(&self, tool: &str, args: &Value, idempotency_key: Option<&str>) -> Result<Value, ToolError> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push((tool.to_string(), args.clone(), idempotency_key.map(str::to_string)));
        let keyed = script
            .keyed
            .iter()
            .find(|(t, field, value, _)| t == tool && args.get(field) == Some(value))
            .map(|(_, _, _, response)| response.clone());
        if let Some(response) = keyed {
            return response;
        }
        if let Some(response) = script.queued.get_mut(tool).and_then(VecDeque::pop_front) {
            return response;
        }
        script
            .fallback
            .get(tool)
            .cloned()
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Reasoning
// ---------------------------------------------------------------------------

/// Reasoning provider returning queued answers, then a fixed one.
#[derive(Clone, Default)]
pub(crate) struct ScriptedReasoning {
    queued: Arc<Mutex<VecDeque<Value>>>,
    fallback: Arc<Mutex<Option<Value>>>,
}

impl ScriptedReasoning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, value: Value) -> &Self {
        *self.fallback.lock().unwrap() = Some(value);
        self
    }

    pub fn push(&self, value: Value) -> &Self {
        self.queued.lock().unwrap().push_back(value);
        self
    }
}

impl ReasoningCapability for ScriptedReasoning {
    async fn reason(&self, _prompt: &str, _schema: &Value) -> Result<Value, ReasoningError> {
        if let Some(value) = self.queued.lock().unwrap().pop_front() {
            return Ok(value);
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ReasoningError::Unavailable("no scripted answer".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Engine helpers
// ---------------------------------------------------------------------------

/// Default config with retry delays shrunk for tests.
pub(crate) fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tools.retry_backoff_ms = 1;
    config.reasoning.retry_backoff_ms = 1;
    config.reasoning.timeout_secs = 5;
    config
}

pub(crate) fn engine_with<P: WorkflowState>(
    store: InMemoryStore,
    config: EngineConfig,
    tools: &ScriptedTools,
    reasoning: &ScriptedReasoning,
) -> WorkflowEngine<InMemoryStore, P> {
    let services = EngineServices::new(
        BoxToolInvoker::new(tools.clone()),
        BoxReasoning::new(reasoning.clone()),
    )
    .with_submission_tools(["submit_request", "submit_appeal"]);
    WorkflowEngine::new(store, config, services).unwrap()
}

pub(crate) fn engine<P: WorkflowState>(store: InMemoryStore) -> WorkflowEngine<InMemoryStore, P> {
    engine_with(store, fast_config(), &ScriptedTools::new(), &ScriptedReasoning::new())
}

/// Wait until `check` holds for the instance report, panicking after five seconds.
pub(crate) async fn wait_until<P, F>(engine: &WorkflowEngine<InMemoryStore, P>, id: Uuid, check: F) -> InstanceReport
where
    P: WorkflowState,
    F: Fn(&InstanceReport) -> bool,
{
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = engine.describe(id).await.unwrap();
            if check(&report) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    match reached {
        Ok(report) => report,
        Err(_) => panic!("instance {id} never reached the expected state: {:?}", engine.describe(id).await.unwrap()),
    }
}

pub(crate) async fn wait_for<P: WorkflowState>(
    engine: &WorkflowEngine<InMemoryStore, P>,
    id: Uuid,
    status: InstanceStatus,
) -> InstanceReport {
    wait_until(engine, id, |report| report.status == status).await
}
