//! Node handler contract.
//!
//! A handler receives the validated state and a `NodeContext`, runs to
//! completion (including any tool or reasoning calls), and returns a
//! `Transition` telling the executor what to do next. Handlers may be re-run
//! after a crash, so they must be idempotent or check their preconditions.

use std::future::Future;
use std::sync::Arc;

use authflow_types::fanout::FanInSummary;
use authflow_types::task::{TaskRequest, TaskType};
use authflow_types::workflow::ResumeInput;
use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use super::decision::DecisionPolicy;
use super::error::EngineError;
use super::reasoning::ReasoningBoundary;
use super::tool::{GuardedToolInvoker, ToolCall};

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// What a node asks the executor to do after it ran.
#[derive(Debug, Clone)]
pub enum Transition<P> {
    /// Move on. `next: None` consults the routing table.
    Continue { state: P, next: Option<String> },
    /// Open a human task and suspend. `resume_at: None` re-enters this node.
    Pause {
        state: P,
        request: TaskRequest,
        resume_at: Option<String>,
    },
    /// Watch an external resource and suspend. `resume_at: None` re-enters this node.
    Watch {
        state: P,
        resource_id: String,
        resume_at: Option<String>,
    },
    /// Spawn one child per item and suspend until all finish.
    Fanout { state: P, items: Vec<P> },
    /// Irrecoverable failure; the instance is marked FAILED with this message.
    Fail(String),
    /// Finish the instance with this final state.
    Complete(P),
}

impl<P> Transition<P> {
    /// Continue along the routing table.
    pub fn next(state: P) -> Self {
        Transition::Continue { state, next: None }
    }

    /// Continue to an explicit node (must be a declared edge target).
    pub fn goto(state: P, node: impl Into<String>) -> Self {
        Transition::Continue {
            state,
            next: Some(node.into()),
        }
    }

    pub fn pause(state: P, request: TaskRequest) -> Self {
        Transition::Pause {
            state,
            request,
            resume_at: None,
        }
    }

    pub fn watch(state: P, resource_id: impl Into<String>) -> Self {
        Transition::Watch {
            state,
            resource_id: resource_id.into(),
            resume_at: None,
        }
    }

    pub fn fanout(state: P, items: Vec<P>) -> Self {
        Transition::Fanout { state, items }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::Continue { .. } => "continue",
            Transition::Pause { .. } => "pause",
            Transition::Watch { .. } => "watch",
            Transition::Fanout { .. } => "fanout",
            Transition::Fail(_) => "fail",
            Transition::Complete(_) => "complete",
        }
    }
}

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

/// Everything a handler may use besides its state.
#[derive(Clone)]
pub struct NodeContext {
    instance_id: Uuid,
    node_id: String,
    step: u32,
    resume_input: Option<ResumeInput>,
    policy: Option<Arc<DecisionPolicy>>,
    tools: Arc<GuardedToolInvoker>,
    reasoning: Arc<ReasoningBoundary>,
}

impl NodeContext {
    pub(crate) fn new(
        instance_id: Uuid,
        node_id: impl Into<String>,
        step: u32,
        resume_input: Option<ResumeInput>,
        policy: Option<Arc<DecisionPolicy>>,
        tools: Arc<GuardedToolInvoker>,
        reasoning: Arc<ReasoningBoundary>,
    ) -> Self {
        Self {
            instance_id,
            node_id: node_id.into(),
            step,
            resume_input,
            policy,
            tools,
            reasoning,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Step number this execution will be checkpointed under.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Input the instance was resumed with, if this node is the resume point.
    pub fn resume_input(&self) -> Option<&ResumeInput> {
        self.resume_input.as_ref()
    }

    /// Resolution of the human task this node paused on.
    pub fn task_resolution(&self) -> Option<(TaskType, &Value)> {
        match &self.resume_input {
            Some(ResumeInput::TaskResolved {
                task_type,
                resolution,
                ..
            }) => Some((*task_type, resolution)),
            _ => None,
        }
    }

    /// Status reported for the resource this node watched.
    pub fn watch_status(&self) -> Option<&Value> {
        match &self.resume_input {
            Some(ResumeInput::StatusChanged { status, .. }) => Some(status),
            _ => None,
        }
    }

    pub fn fan_in_summary(&self) -> Option<&FanInSummary> {
        match &self.resume_input {
            Some(ResumeInput::FanIn(summary)) => Some(summary),
            _ => None,
        }
    }

    /// Policy of the decision point this node belongs to.
    pub fn policy(&self) -> Option<&DecisionPolicy> {
        self.policy.as_deref()
    }

    /// Deterministic key for submission-style calls: `{instance}-{node}-{step}`.
    ///
    /// A re-run of the same node execution after a crash gets the same key.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}-{}", self.instance_id, self.node_id, self.step)
    }

    pub fn tools(&self) -> &GuardedToolInvoker {
        &self.tools
    }

    /// Invoke a tool through the guarded invoker.
    pub async fn invoke(&self, call: ToolCall) -> Result<Value, EngineError> {
        self.tools.invoke(call).await
    }

    /// Invoke a submission tool keyed with this execution's idempotency key.
    pub async fn submit(&self, tool: &str, args: Value) -> Result<Value, EngineError> {
        let call = ToolCall::new(tool, args).with_idempotency_key(self.idempotency_key());
        self.tools.invoke(call).await
    }

    pub fn reasoning(&self) -> &ReasoningBoundary {
        &self.reasoning
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("instance_id", &self.instance_id)
            .field("node_id", &self.node_id)
            .field("step", &self.step)
            .field("resume_input", &self.resume_input)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// NodeHandler
// ---------------------------------------------------------------------------

/// Boxed future returned by node handlers.
pub type NodeFuture<P> = BoxFuture<'static, Result<Transition<P>, EngineError>>;

/// Object-safe node handler.
pub trait NodeHandler<P>: Send + Sync {
    fn run(&self, state: P, ctx: NodeContext) -> NodeFuture<P>;
}

struct FnHandler<F>(F);

impl<P, F, Fut> NodeHandler<P> for FnHandler<F>
where
    F: Fn(P, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Transition<P>, EngineError>> + Send + 'static,
{
    fn run(&self, state: P, ctx: NodeContext) -> NodeFuture<P> {
        Box::pin((self.0)(state, ctx))
    }
}

/// Adapt an async closure into a shared node handler.
pub fn handler_fn<P, F, Fut>(f: F) -> Arc<dyn NodeHandler<P>>
where
    P: 'static,
    F: Fn(P, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Transition<P>, EngineError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
