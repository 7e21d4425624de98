//! Workflow executor: checkpointed state machine over a definition graph.
//!
//! The `WorkflowEngine` steps instances node by node. After every node it
//! writes a checkpoint (state after the node, node to run next) before the
//! transition takes effect anywhere else, so a crash resumes at the pending
//! node. Suspensions (human task, status watch, fan-out) are recorded in the
//! checkpoint first and applied second; a resume that finds an unapplied
//! suspension re-applies it instead of re-running the node.
//!
//! # Concurrency
//!
//! - One tokio mutex per instance serialises every mutation of that instance
//!   (step loop, task resolution, watch delivery, fan-in, cancel).
//! - A worker semaphore bounds how many instances step at once.
//! - Children of a fan-out additionally hold a slot of the runner's semaphore.
//! - Work that re-enters the engine (child runs, fan-ins) is spawned as boxed
//!   `'static` futures.

use std::sync::Arc;
use std::time::Duration;

use authflow_types::config::EngineConfig;
use authflow_types::event::EngineEvent;
use authflow_types::fanout::{ChildOutcome, FanInSummary, SubworkflowFanout};
use authflow_types::payload::WorkflowState;
use authflow_types::task::{HumanTask, TaskPayload, TaskPriority, TaskRequest, TaskStatus};
use authflow_types::watch::AsyncWatch;
use authflow_types::workflow::{
    Blocker, Checkpoint, InstanceStatus, NodeKind, ParentLink, ResumeInput, Suspension,
    WorkflowInstance,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::EngineStore;

use super::checkpoint::CheckpointManager;
use super::definition::{
    ChildResult, DefinitionBuilder, NodeSpec, PartialFailurePolicy, WorkflowDefinition,
};
use super::error::EngineError;
use super::event_bridge::{PollOutcome, WatchRegistry, same_due_slot};
use super::node::{NodeContext, Transition};
use super::reasoning::{BoxReasoning, ReasoningBoundary};
use super::registry::DefinitionRegistry;
use super::retry::RetryPolicy;
use super::routing::Target;
use super::subworkflow::SubworkflowRunner;
use super::task_gate::TaskGate;
use super::tool::{AuditSink, BoxToolInvoker, GuardedToolInvoker, TracingAuditSink};

// ---------------------------------------------------------------------------
// Services and reports
// ---------------------------------------------------------------------------

/// External collaborators the engine is wired to.
pub struct EngineServices {
    pub tools: BoxToolInvoker,
    pub reasoning: BoxReasoning,
    pub audit: Arc<dyn AuditSink>,
    pub events: EventBus,
    /// Tools whose calls need an idempotency key.
    pub submission_tools: Vec<String>,
}

impl EngineServices {
    /// Services with the tracing audit sink and a fresh event bus.
    pub fn new(tools: BoxToolInvoker, reasoning: BoxReasoning) -> Self {
        Self {
            tools,
            reasoning,
            audit: Arc::new(TracingAuditSink),
            events: EventBus::default(),
            submission_tools: Vec::new(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_submission_tools<I, T>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.submission_tools.extend(tools.into_iter().map(Into::into));
        self
    }
}

/// Returned by `launch` once control yields.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchReport {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    /// False while any record of the instance is only held in memory.
    pub durable: bool,
}

/// What an operator needs to unblock a suspended instance.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockerDetail {
    Task(HumanTask),
    Watch(AsyncWatch),
    Fanout {
        fanout_id: Uuid,
        expected: usize,
        completed: usize,
        failed_indices: Vec<usize>,
    },
}

/// Operator view of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReport {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub intake_id: Option<String>,
    pub status: InstanceStatus,
    pub current_node: Option<String>,
    pub step_count: u32,
    pub error: Option<String>,
    pub blocker: Option<BlockerDetail>,
    pub durable: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Instances found RUNNING and driven again.
    pub resumed: Vec<Uuid>,
    /// Fan-ins completed for parents still waiting on finished children.
    pub fan_ins: usize,
    /// Resolutions delivered to instances still paused on a resolved task.
    pub tasks_delivered: usize,
    /// Watches re-registered for instances paused on a missing watch.
    pub watches_restored: usize,
    pub failed: Vec<(Uuid, String)>,
}

enum Step {
    Next,
    Yield(InstanceStatus),
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner<S: EngineStore, P: WorkflowState> {
    config: EngineConfig,
    checkpoints: CheckpointManager<S>,
    gate: TaskGate<S>,
    runner: SubworkflowRunner<S>,
    watches: WatchRegistry<S>,
    registry: DefinitionRegistry<P>,
    tools: Arc<GuardedToolInvoker>,
    reasoning: Arc<ReasoningBoundary>,
    events: EventBus,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    cancel_tokens: DashMap<Uuid, CancellationToken>,
    workers: Semaphore,
}

/// Durable workflow engine over store `S` and state payload `P`.
///
/// Cheap to clone; clones share everything.
pub struct WorkflowEngine<S: EngineStore, P: WorkflowState> {
    inner: Arc<EngineInner<S, P>>,
}

impl<S: EngineStore, P: WorkflowState> Clone for WorkflowEngine<S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: EngineStore, P: WorkflowState> WorkflowEngine<S, P> {
    /// Build an engine. Fails with `Validation` on an unusable config.
    pub fn new(store: S, config: EngineConfig, services: EngineServices) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Validation)?;

        let store = Arc::new(store);
        let events = services.events;

        let tool_retry = RetryPolicy::new(
            config.tools.max_attempts,
            Duration::from_millis(config.tools.retry_backoff_ms),
        );
        let tools = GuardedToolInvoker::new(services.tools, services.audit, tool_retry)
            .with_submission_tools(services.submission_tools);

        let reasoning_retry = RetryPolicy::new(
            config.reasoning.max_attempts,
            Duration::from_millis(config.reasoning.retry_backoff_ms),
        );
        let reasoning = ReasoningBoundary::new(
            services.reasoning,
            reasoning_retry,
            Duration::from_secs(config.reasoning.timeout_secs),
        );

        let inner = EngineInner {
            checkpoints: CheckpointManager::new(store.clone(), events.clone()),
            gate: TaskGate::new(store.clone(), events.clone()),
            runner: SubworkflowRunner::new(store.clone(), events.clone(), config.fanout.max_concurrency),
            watches: WatchRegistry::new(store, events.clone(), config.watch.clone()),
            registry: DefinitionRegistry::new(),
            tools: Arc::new(tools),
            reasoning: Arc::new(reasoning),
            events,
            locks: DashMap::new(),
            cancel_tokens: DashMap::new(),
            workers: Semaphore::new(config.executor.worker_pool_size),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// A definition builder seeded with the configured step limit and threshold.
    pub fn builder(&self, id: impl Into<String>, entry: impl Into<String>) -> DefinitionBuilder<P> {
        DefinitionBuilder::new(id, entry).defaults(
            self.inner.config.executor.default_step_limit,
            self.inner.config.decision.default_threshold,
        )
    }

    pub fn register(&self, definition: WorkflowDefinition<P>) -> Result<(), EngineError> {
        self.inner.registry.register(definition)
    }

    pub fn definition_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    pub(crate) fn tools(&self) -> &GuardedToolInvoker {
        &self.inner.tools
    }

    pub(crate) fn watches(&self) -> &WatchRegistry<S> {
        &self.inner.watches
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.inner.locks.entry(id).or_default().clone()
    }

    fn token_for(&self, id: Uuid) -> CancellationToken {
        self.inner.cancel_tokens.entry(id).or_default().clone()
    }

    /// Drop the bookkeeping of a terminal instance. A lock someone still
    /// holds or waits on stays.
    fn forget(&self, id: Uuid) {
        self.inner.cancel_tokens.remove(&id);
        self.inner.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Per-instance bookkeeping still held: (locks, cancel tokens).
    #[cfg(test)]
    pub(crate) fn tracked_instances(&self) -> (usize, usize) {
        (self.inner.locks.len(), self.inner.cancel_tokens.len())
    }

    async fn load_instance(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.inner
            .checkpoints
            .get_instance(&id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Create and persist a RUNNING instance without stepping it.
    async fn create_instance(
        &self,
        intake_id: Option<String>,
        definition_id: &str,
        state: &P,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self.inner.registry.get(definition_id)?;
        state
            .validate()
            .map_err(|e| EngineError::Validation(format!("initial state: {e}")))?;
        let value = encode(state)?;

        let mut instance = WorkflowInstance::new(definition.id(), definition.entry(), value.clone());
        instance.intake_id = intake_id;

        let checkpoint = Checkpoint::new(instance.id, 0, value, Some(definition.entry().to_string()));
        self.inner.checkpoints.save_checkpoint(&checkpoint).await;
        self.inner.checkpoints.save_instance(&instance).await;

        tracing::info!(
            instance_id = %instance.id,
            definition_id = definition.id(),
            intake_id = instance.intake_id.as_deref().unwrap_or("-"),
            "instance started"
        );
        self.inner.events.publish(EngineEvent::InstanceStarted {
            instance_id: instance.id,
            definition_id: definition.id().to_string(),
            parent_instance_id: None,
        });
        Ok(instance)
    }

    /// Start an instance for an intake and step it until control yields.
    pub async fn launch(
        &self,
        intake_id: &str,
        definition_id: &str,
        initial_state: P,
    ) -> Result<LaunchReport, EngineError> {
        if intake_id.trim().is_empty() {
            return Err(EngineError::Validation("intake id must not be blank".to_string()));
        }
        let instance = self
            .create_instance(Some(intake_id.to_string()), definition_id, &initial_state)
            .await?;
        let status = self.drive(instance.id).await?;
        Ok(LaunchReport {
            instance_id: instance.id,
            status,
            durable: !self.inner.checkpoints.is_buffered(&instance.id),
        })
    }

    /// Start an instance and step it in the background.
    pub async fn start(&self, definition_id: &str, initial_state: P) -> Result<Uuid, EngineError> {
        let instance = self.create_instance(None, definition_id, &initial_state).await?;
        let id = instance.id;
        let run = self.drive_boxed(id);
        tokio::spawn(async move {
            if let Err(e) = run.await {
                tracing::warn!(instance_id = %id, error = %e, "background run stopped");
            }
        });
        Ok(id)
    }

    /// Step a RUNNING instance until control yields. Suspended and terminal
    /// instances report their status unchanged.
    pub async fn resume(&self, instance_id: Uuid) -> Result<InstanceStatus, EngineError> {
        self.drive_boxed(instance_id).await
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    fn drive_boxed(&self, id: Uuid) -> BoxFuture<'static, Result<InstanceStatus, EngineError>> {
        let engine = self.clone();
        Box::pin(async move { engine.drive(id).await })
    }

    async fn drive(&self, id: Uuid) -> Result<InstanceStatus, EngineError> {
        let status = {
            let _permit = self
                .inner
                .workers
                .acquire()
                .await
                .map_err(|_| EngineError::InvalidState("worker pool closed".to_string()))?;
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;
            self.drive_locked(id).await?
        };

        if status.is_terminal() {
            self.forget(id);
            self.report_if_child(id).await?;
        }
        Ok(status)
    }

    async fn drive_locked(&self, id: Uuid) -> Result<InstanceStatus, EngineError> {
        let mut instance = self.load_instance(id).await?;
        if instance.status.is_terminal() {
            return Ok(instance.status);
        }
        let definition = self.inner.registry.get(&instance.definition_id)?;

        if let Some(checkpoint) = self.inner.checkpoints.load_checkpoint(&id).await? {
            if checkpoint.step_count > instance.step_count {
                // crashed between checkpoint and instance write
                tracing::info!(
                    instance_id = %id,
                    from = instance.step_count,
                    to = checkpoint.step_count,
                    "instance record behind checkpoint, fast-forwarding"
                );
                instance.step_count = checkpoint.step_count;
                instance.state = checkpoint.state.clone();
                instance.current_node = checkpoint.pending_node.clone();
                instance.resume_input = None;
                instance.blocker = None;
                if instance.status != InstanceStatus::Running {
                    instance.transition(InstanceStatus::Running);
                }
                if checkpoint.pending_node.is_none() {
                    return Ok(self.mark_completed(&mut instance).await);
                }
            }

            if instance.status == InstanceStatus::Running
                && instance.blocker.is_none()
                && checkpoint.step_count == instance.step_count
            {
                if let Some(suspension) = checkpoint.suspension {
                    tracing::info!(instance_id = %id, step = instance.step_count, "re-applying recorded suspension");
                    return match self.apply_suspension(&definition, &mut instance, suspension).await {
                        Ok(status) => Ok(status),
                        Err(e) if e.is_instance_fatal() => Ok(self.mark_failed(&mut instance, e).await),
                        Err(e) => Err(e),
                    };
                }
            }
        }

        if instance.status == InstanceStatus::Paused {
            return Ok(InstanceStatus::Paused);
        }
        self.run_loop(&definition, &mut instance).await
    }

    async fn run_loop(
        &self,
        definition: &WorkflowDefinition<P>,
        instance: &mut WorkflowInstance,
    ) -> Result<InstanceStatus, EngineError> {
        let token = self.token_for(instance.id);

        loop {
            if token.is_cancelled() {
                return Ok(self.mark_cancelled(instance).await);
            }
            let Some(node_id) = instance.current_node.clone() else {
                return Ok(self.mark_completed(instance).await);
            };
            if instance.step_count >= definition.step_limit() {
                let error = EngineError::StepLimitExceeded {
                    limit: definition.step_limit(),
                };
                return Ok(self.mark_failed(instance, error).await);
            }
            let Some(node) = definition.node(&node_id) else {
                let error = EngineError::Routing {
                    node: node_id,
                    reason: "node is not part of the definition".to_string(),
                };
                return Ok(self.mark_failed(instance, error).await);
            };
            let state: P = match decode(&instance.state) {
                Ok(state) => state,
                Err(e) => return Ok(self.mark_failed(instance, e).await),
            };

            let step = instance.step_count + 1;
            tracing::debug!(
                instance_id = %instance.id,
                node = node_id.as_str(),
                step,
                stage = state.stage(),
                "running node"
            );
            let ctx = NodeContext::new(
                instance.id,
                node_id.as_str(),
                step,
                instance.resume_input.clone(),
                node.policy.clone(),
                self.inner.tools.clone(),
                self.inner.reasoning.clone(),
            );

            let transition = match node.handler.run(state, ctx).await {
                Ok(transition) => transition,
                Err(e) if e.is_instance_fatal() => return Ok(self.mark_failed(instance, e).await),
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        node = node_id.as_str(),
                        error = %e,
                        "node stopped without failing the instance"
                    );
                    return Err(e);
                }
            };

            instance.step_count = step;
            instance.resume_input = None;
            match self.apply_transition(definition, node, instance, transition).await {
                Ok(Step::Next) => continue,
                Ok(Step::Yield(status)) => return Ok(status),
                Err(e) if e.is_instance_fatal() => return Ok(self.mark_failed(instance, e).await),
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_transition(
        &self,
        definition: &WorkflowDefinition<P>,
        node: &NodeSpec<P>,
        instance: &mut WorkflowInstance,
        transition: Transition<P>,
    ) -> Result<Step, EngineError> {
        let node_id = node.id.as_str();
        match transition {
            Transition::Continue { state, next } => {
                check_state(&state)?;
                let target = match next {
                    Some(_) if node.kind == NodeKind::Decision => {
                        return Err(EngineError::Routing {
                            node: node_id.to_string(),
                            reason: "decision nodes route through their policy".to_string(),
                        });
                    }
                    Some(to) if !definition.allows_jump(node_id, &to) => {
                        return Err(EngineError::Routing {
                            node: node_id.to_string(),
                            reason: format!("no edge to '{to}'"),
                        });
                    }
                    Some(to) => Target::Node(to),
                    None => definition.route(node_id, &state)?,
                };
                match target {
                    Target::End => self.complete_with(instance, node_id, &state).await,
                    Target::Node(to) => self.advance(instance, node_id, &state, to).await,
                }
            }
            Transition::Complete(state) => {
                check_state(&state)?;
                self.complete_with(instance, node_id, &state).await
            }
            Transition::Fail(message) => Err(EngineError::NodeFailed {
                node: node_id.to_string(),
                message,
            }),
            Transition::Pause {
                state,
                request,
                resume_at,
            } => {
                require_kind(node, NodeKind::Pause, "pause")?;
                let resume = resume_target(definition, node_id, resume_at)?;
                check_state(&state)?;
                request.payload.validate()?;
                self.suspend(definition, instance, node_id, &state, resume, Suspension::HumanTask { request })
                    .await
            }
            Transition::Watch {
                state,
                resource_id,
                resume_at,
            } => {
                require_kind(node, NodeKind::Pause, "watch")?;
                let resume = resume_target(definition, node_id, resume_at)?;
                check_state(&state)?;
                if resource_id.trim().is_empty() {
                    return Err(EngineError::Validation("watched resource id must not be blank".to_string()));
                }
                self.suspend(definition, instance, node_id, &state, resume, Suspension::Watch { resource_id })
                    .await
            }
            Transition::Fanout { state, items } => {
                require_kind(node, NodeKind::Subworkflow, "fan out")?;
                let spec = node.subworkflow.as_ref().ok_or_else(|| {
                    EngineError::Validation(format!("node '{node_id}' has no sub-workflow spec"))
                })?;
                check_state(&state)?;
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    item.validate().map_err(|e| {
                        EngineError::Validation(format!("fan-out item {index}: {e}"))
                    })?;
                    values.push(encode(item)?);
                }
                let suspension = Suspension::Fanout {
                    node: node_id.to_string(),
                    items: values,
                };
                self.suspend(definition, instance, node_id, &state, spec.fan_in.clone(), suspension)
                    .await
            }
        }
    }

    /// Checkpoint and move on to `to`.
    async fn advance(
        &self,
        instance: &mut WorkflowInstance,
        from: &str,
        state: &P,
        to: String,
    ) -> Result<Step, EngineError> {
        let value = encode(state)?;
        let checkpoint = Checkpoint::new(instance.id, instance.step_count, value.clone(), Some(to.clone()));
        let durable = self.inner.checkpoints.save_checkpoint(&checkpoint).await;

        instance.state = value;
        instance.current_node = Some(to);
        instance.updated_at = Utc::now();
        self.inner.checkpoints.save_instance(instance).await;

        self.inner.events.publish(EngineEvent::NodeCompleted {
            instance_id: instance.id,
            node: from.to_string(),
            step: instance.step_count,
            durable,
        });
        Ok(Step::Next)
    }

    async fn complete_with(
        &self,
        instance: &mut WorkflowInstance,
        from: &str,
        state: &P,
    ) -> Result<Step, EngineError> {
        let value = encode(state)?;
        let checkpoint = Checkpoint::new(instance.id, instance.step_count, value.clone(), None);
        let durable = self.inner.checkpoints.save_checkpoint(&checkpoint).await;

        instance.state = value;
        instance.current_node = None;
        self.inner.events.publish(EngineEvent::NodeCompleted {
            instance_id: instance.id,
            node: from.to_string(),
            step: instance.step_count,
            durable,
        });
        Ok(Step::Yield(self.mark_completed(instance).await))
    }

    /// Record the suspension in the checkpoint, then apply it.
    async fn suspend(
        &self,
        definition: &WorkflowDefinition<P>,
        instance: &mut WorkflowInstance,
        from: &str,
        state: &P,
        resume_at: String,
        suspension: Suspension,
    ) -> Result<Step, EngineError> {
        let value = encode(state)?;
        let checkpoint = Checkpoint::new(instance.id, instance.step_count, value.clone(), Some(resume_at.clone()))
            .with_suspension(suspension.clone());
        let durable = self.inner.checkpoints.save_checkpoint(&checkpoint).await;

        instance.state = value;
        instance.current_node = Some(resume_at);
        self.inner.events.publish(EngineEvent::NodeCompleted {
            instance_id: instance.id,
            node: from.to_string(),
            step: instance.step_count,
            durable,
        });

        let status = self.apply_suspension(definition, instance, suspension).await?;
        Ok(Step::Yield(status))
    }

    /// Create the task, register the watch or spawn the children. Idempotent:
    /// an open task, a watch or a fan-out left from before a crash is adopted.
    async fn apply_suspension(
        &self,
        definition: &WorkflowDefinition<P>,
        instance: &mut WorkflowInstance,
        suspension: Suspension,
    ) -> Result<InstanceStatus, EngineError> {
        match suspension {
            Suspension::HumanTask { request } => {
                let task = self.inner.gate.open_or_adopt(instance.id, request).await?;
                let reason = format!("human_task:{}", task.task_type);
                let blocker = Blocker::HumanTask {
                    task_id: task.id,
                    task_type: task.task_type,
                };
                Ok(self.pause(instance, blocker, reason).await)
            }
            Suspension::Watch { resource_id } => {
                match self.inner.watches.register(instance.id, &resource_id).await {
                    Ok(_) => {
                        let reason = format!("watch:{resource_id}");
                        Ok(self.pause(instance, Blocker::Watch { resource_id }, reason).await)
                    }
                    Err(EngineError::WatchCapacityExceeded(max)) => {
                        tracing::warn!(
                            instance_id = %instance.id,
                            resource_id = resource_id.as_str(),
                            max_watches = max,
                            "watch capacity reached, escalating"
                        );
                        let reason = format!("watch capacity of {max} reached");
                        let task = self
                            .inner
                            .gate
                            .open_or_adopt(instance.id, escalation_request(&resource_id, 0, reason))
                            .await?;
                        self.inner.events.publish(EngineEvent::WatchEscalated {
                            instance_id: instance.id,
                            resource_id,
                            attempts: 0,
                        });
                        let blocker = Blocker::HumanTask {
                            task_id: task.id,
                            task_type: task.task_type,
                        };
                        Ok(self
                            .pause(instance, blocker, format!("human_task:{}", task.task_type))
                            .await)
                    }
                    Err(e) => Err(e),
                }
            }
            Suspension::Fanout { node, items } => {
                self.start_fanout(definition, instance, &node, items).await
            }
        }
    }

    async fn pause(&self, instance: &mut WorkflowInstance, blocker: Blocker, reason: String) -> InstanceStatus {
        instance.blocker = Some(blocker);
        instance.transition(InstanceStatus::Paused);
        self.inner.checkpoints.save_instance(instance).await;

        let node = instance.current_node.clone().unwrap_or_default();
        tracing::info!(
            instance_id = %instance.id,
            node = node.as_str(),
            reason = reason.as_str(),
            "instance paused"
        );
        self.inner.events.publish(EngineEvent::InstancePaused {
            instance_id: instance.id,
            node,
            reason,
        });
        InstanceStatus::Paused
    }

    /// Hand a resume input to a suspended instance and mark it RUNNING.
    ///
    /// The checkpoint is re-stamped at the same step with the state to resume
    /// from; the input stays on the instance until the resumed node's own
    /// checkpoint, so a crash in between delivers it again.
    async fn deliver(&self, instance: &mut WorkflowInstance, state: Value, input: ResumeInput) {
        let checkpoint = Checkpoint::new(
            instance.id,
            instance.step_count,
            state.clone(),
            instance.current_node.clone(),
        );
        self.inner.checkpoints.save_checkpoint(&checkpoint).await;

        instance.state = state;
        instance.blocker = None;
        instance.resume_input = Some(input);
        instance.transition(InstanceStatus::Running);
        self.inner.checkpoints.save_instance(instance).await;

        let node = instance.current_node.clone().unwrap_or_default();
        tracing::info!(instance_id = %instance.id, node = node.as_str(), "instance resumed");
        self.inner.events.publish(EngineEvent::InstanceResumed {
            instance_id: instance.id,
            node,
        });
    }

    async fn mark_completed(&self, instance: &mut WorkflowInstance) -> InstanceStatus {
        instance.current_node = None;
        instance.resume_input = None;
        instance.transition(InstanceStatus::Completed);
        self.inner.checkpoints.save_instance(instance).await;

        tracing::info!(instance_id = %instance.id, steps = instance.step_count, "instance completed");
        self.inner.events.publish(EngineEvent::InstanceCompleted {
            instance_id: instance.id,
            steps: instance.step_count,
        });
        InstanceStatus::Completed
    }

    async fn mark_failed(&self, instance: &mut WorkflowInstance, error: EngineError) -> InstanceStatus {
        let message = error.to_string();
        tracing::error!(
            instance_id = %instance.id,
            node = instance.current_node.as_deref().unwrap_or("-"),
            step = instance.step_count,
            error = message.as_str(),
            "instance failed"
        );
        instance.error = Some(message.clone());
        instance.transition(InstanceStatus::Failed);
        self.inner.checkpoints.save_instance(instance).await;

        self.inner.events.publish(EngineEvent::InstanceFailed {
            instance_id: instance.id,
            error: message,
        });
        InstanceStatus::Failed
    }

    async fn mark_cancelled(&self, instance: &mut WorkflowInstance) -> InstanceStatus {
        instance.transition(InstanceStatus::Cancelled);
        self.inner.checkpoints.save_instance(instance).await;

        tracing::info!(
            instance_id = %instance.id,
            node = instance.current_node.as_deref().unwrap_or("-"),
            "instance cancelled"
        );
        self.inner.events.publish(EngineEvent::InstanceCancelled {
            instance_id: instance.id,
        });
        InstanceStatus::Cancelled
    }

    // -----------------------------------------------------------------------
    // Fan-out / fan-in
    // -----------------------------------------------------------------------

    async fn start_fanout(
        &self,
        definition: &WorkflowDefinition<P>,
        instance: &mut WorkflowInstance,
        node_id: &str,
        items: Vec<Value>,
    ) -> Result<InstanceStatus, EngineError> {
        let spec = definition
            .node(node_id)
            .and_then(|n| n.subworkflow.as_ref())
            .ok_or_else(|| EngineError::Validation(format!("node '{node_id}' has no sub-workflow spec")))?;
        let child_definition = self.inner.registry.get(&spec.child_definition)?;

        let fanout = match self.inner.runner.for_parent(instance.id).await? {
            Some(existing) => {
                tracing::debug!(fanout_id = %existing.id, instance_id = %instance.id, "adopting fan-out");
                existing
            }
            None => {
                let ids = items.iter().map(|_| Uuid::now_v7()).collect();
                let fanout = SubworkflowFanout::new(instance.id, node_id, child_definition.id(), ids);
                self.inner.runner.begin(&fanout).await?;
                fanout
            }
        };

        for (index, (child_id, item)) in fanout.child_instance_ids.iter().zip(items).enumerate() {
            if self.inner.checkpoints.get_instance(child_id).await?.is_some() {
                continue;
            }
            let mut child = WorkflowInstance::new(child_definition.id(), child_definition.entry(), item.clone());
            child.id = *child_id;
            child.intake_id = instance.intake_id.clone();
            child.parent = Some(ParentLink {
                parent_instance_id: instance.id,
                fanout_id: fanout.id,
                index,
            });

            let checkpoint = Checkpoint::new(child.id, 0, item, Some(child_definition.entry().to_string()));
            self.inner.checkpoints.save_checkpoint(&checkpoint).await;
            self.inner.checkpoints.save_instance(&child).await;
            self.inner.events.publish(EngineEvent::InstanceStarted {
                instance_id: child.id,
                definition_id: child_definition.id().to_string(),
                parent_instance_id: Some(instance.id),
            });
        }

        let blocker = Blocker::Fanout {
            fanout_id: fanout.id,
            expected: fanout.expected_count,
        };
        let reason = format!("fanout:{}", fanout.expected_count);
        let status = self.pause(instance, blocker, reason).await;

        if fanout.is_complete() {
            self.spawn_fan_in(instance.id, fanout.id);
        } else {
            for (index, child_id) in fanout.child_instance_ids.iter().enumerate() {
                if !fanout.outcomes.contains_key(&index) {
                    self.spawn_child(*child_id);
                }
            }
        }
        Ok(status)
    }

    fn spawn_child(&self, child_id: Uuid) {
        let slots = self.inner.runner.slots();
        let run = self.drive_boxed(child_id);
        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return;
            };
            if let Err(e) = run.await {
                tracing::warn!(instance_id = %child_id, error = %e, "child run stopped");
            }
        });
    }

    fn spawn_fan_in(&self, parent_id: Uuid, fanout_id: Uuid) {
        let fan_in = self.fan_in_boxed(parent_id, fanout_id);
        tokio::spawn(async move {
            if let Err(e) = fan_in.await {
                tracing::warn!(
                    instance_id = %parent_id,
                    fanout_id = %fanout_id,
                    error = %e,
                    "fan-in stopped"
                );
            }
        });
    }

    /// Report a terminal child to its fan-out.
    async fn report_if_child(&self, id: Uuid) -> Result<(), EngineError> {
        let Some(child) = self.inner.checkpoints.get_instance(&id).await? else {
            return Ok(());
        };
        let Some(link) = child.parent else {
            return Ok(());
        };
        if !child.status.is_terminal() {
            return Ok(());
        }
        if let Some(fanout) = self
            .inner
            .runner
            .record_completion(link.fanout_id, child_outcome(&child, &link))
            .await?
        {
            self.spawn_fan_in(link.parent_instance_id, fanout.id);
        }
        Ok(())
    }

    fn fan_in_boxed(
        &self,
        parent_id: Uuid,
        fanout_id: Uuid,
    ) -> BoxFuture<'static, Result<Option<InstanceStatus>, EngineError>> {
        let engine = self.clone();
        Box::pin(async move { engine.fan_in(parent_id, fanout_id).await })
    }

    /// Merge a complete fan-out into its parent and resume it at the fan-in
    /// node. Returns `None` if the parent was not waiting on this fan-out.
    async fn fan_in(
        &self,
        parent_id: Uuid,
        fanout_id: Uuid,
    ) -> Result<Option<InstanceStatus>, EngineError> {
        let failed = {
            let lock = self.lock_for(parent_id);
            let _guard = lock.lock().await;

            let mut parent = self.load_instance(parent_id).await?;
            let waiting = parent.status == InstanceStatus::Paused
                && matches!(parent.blocker, Some(Blocker::Fanout { fanout_id: f, .. }) if f == fanout_id);
            if !waiting {
                tracing::debug!(instance_id = %parent_id, fanout_id = %fanout_id, "parent not waiting on fan-out");
                return Ok(None);
            }
            let Some(fanout) = self.inner.runner.get(fanout_id).await? else {
                return Ok(None);
            };
            if !fanout.is_complete() {
                return Ok(None);
            }

            let definition = self.inner.registry.get(&parent.definition_id)?;
            match self.merge_fanout(&definition, &parent, &fanout) {
                Ok((state, summary)) => {
                    tracing::info!(
                        instance_id = %parent_id,
                        fanout_id = %fanout_id,
                        expected = summary.expected,
                        succeeded = summary.succeeded,
                        "fan-in merged"
                    );
                    self.deliver(&mut parent, state, ResumeInput::FanIn(summary)).await;
                    self.inner.runner.finish(fanout_id).await?;
                    false
                }
                Err(e) => {
                    self.mark_failed(&mut parent, e).await;
                    self.inner.runner.finish(fanout_id).await?;
                    true
                }
            }
        };

        if failed {
            self.report_if_child(parent_id).await?;
            return Ok(Some(InstanceStatus::Failed));
        }
        self.drive(parent_id).await.map(Some)
    }

    fn merge_fanout(
        &self,
        definition: &WorkflowDefinition<P>,
        parent: &WorkflowInstance,
        fanout: &SubworkflowFanout,
    ) -> Result<(Value, FanInSummary), EngineError> {
        let spec = definition
            .node(&fanout.node_id)
            .and_then(|n| n.subworkflow.as_ref())
            .ok_or_else(|| {
                EngineError::Validation(format!("node '{}' has no sub-workflow spec", fanout.node_id))
            })?;

        let summary = fanout.summary();
        if spec.failure_policy == PartialFailurePolicy::FailFanIn && !summary.failed_indices.is_empty() {
            return Err(EngineError::NodeFailed {
                node: fanout.node_id.clone(),
                message: format!(
                    "{} of {} children failed",
                    summary.failed_indices.len(),
                    summary.expected
                ),
            });
        }

        let parent_state: P = decode(&parent.state)?;
        let results: Vec<ChildResult<P>> = fanout
            .ordered_outcomes()
            .into_iter()
            .map(|o| ChildResult {
                index: o.index,
                child_instance_id: o.child_instance_id,
                outcome: child_result(o),
            })
            .collect();

        let merged = (spec.aggregator)(parent_state, results).map_err(|message| EngineError::NodeFailed {
            node: fanout.node_id.clone(),
            message: format!("aggregation failed: {message}"),
        })?;
        check_state(&merged)?;
        Ok((encode(&merged)?, summary))
    }

    // -----------------------------------------------------------------------
    // Human tasks
    // -----------------------------------------------------------------------

    /// Open a human task on an instance and pause it.
    ///
    /// The instance re-enters its current node with the resolution once the
    /// task is resolved. Fails with `TaskAlreadyOpen` if one is already open.
    pub async fn create_task(
        &self,
        instance_id: Uuid,
        request: TaskRequest,
    ) -> Result<HumanTask, EngineError> {
        request.payload.validate()?;
        self.suspend_externally(instance_id, Suspension::HumanTask { request })
            .await?;
        self.inner
            .gate
            .open_task(instance_id)
            .await?
            .ok_or_else(|| EngineError::InvalidState(format!("instance {instance_id} has no open task")))
    }

    /// Resolve a task and resume the instance waiting on it.
    pub async fn resolve_task(
        &self,
        task_id: Uuid,
        resolution: Value,
    ) -> Result<InstanceStatus, EngineError> {
        let task = self.inner.gate.get(task_id).await?;
        let instance_id = task.instance_id;

        {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;
            let resolved = self.inner.gate.resolve(task_id, resolution).await?;
            let mut instance = self.load_instance(instance_id).await?;
            if !self.deliver_task(&mut instance, &resolved).await {
                return Ok(instance.status);
            }
        }
        self.drive(instance_id).await
    }

    /// Resume an instance paused on `task` if the task is resolved.
    async fn deliver_task(&self, instance: &mut WorkflowInstance, task: &HumanTask) -> bool {
        let waiting = instance.status == InstanceStatus::Paused
            && matches!(instance.blocker, Some(Blocker::HumanTask { task_id, .. }) if task_id == task.id);
        if !waiting || task.status != TaskStatus::Resolved {
            return false;
        }
        let input = ResumeInput::TaskResolved {
            task_id: task.id,
            task_type: task.task_type,
            resolution: task.resolution.clone().unwrap_or(Value::Null),
        };
        let state = instance.state.clone();
        self.deliver(instance, state, input).await;
        true
    }

    pub async fn open_task(&self, instance_id: Uuid) -> Result<Option<HumanTask>, EngineError> {
        self.inner.gate.open_task(instance_id).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<HumanTask, EngineError> {
        self.inner.gate.get(task_id).await
    }

    pub async fn list_open_tasks(&self) -> Result<Vec<HumanTask>, EngineError> {
        self.inner.gate.list_open().await
    }

    // -----------------------------------------------------------------------
    // Watches
    // -----------------------------------------------------------------------

    /// Suspend an instance on an external resource.
    pub async fn watch(&self, instance_id: Uuid, resource_id: &str) -> Result<InstanceStatus, EngineError> {
        if resource_id.trim().is_empty() {
            return Err(EngineError::Validation("watched resource id must not be blank".to_string()));
        }
        self.suspend_externally(
            instance_id,
            Suspension::Watch {
                resource_id: resource_id.to_string(),
            },
        )
        .await
    }

    /// Suspend an instance that is not currently suspended, write-ahead.
    async fn suspend_externally(
        &self,
        instance_id: Uuid,
        suspension: Suspension,
    ) -> Result<InstanceStatus, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(instance_id).await?;
        if instance.status == InstanceStatus::Cancelled {
            return Err(EngineError::Cancelled(instance_id));
        }
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "instance {instance_id} is {}",
                instance.status.as_str()
            )));
        }
        match &instance.blocker {
            Some(Blocker::HumanTask { .. }) => return Err(EngineError::TaskAlreadyOpen(instance_id)),
            Some(other) => {
                return Err(EngineError::InvalidState(format!(
                    "instance {instance_id} is already suspended on {other:?}"
                )));
            }
            None => {}
        }
        let definition = self.inner.registry.get(&instance.definition_id)?;

        let checkpoint = Checkpoint::new(
            instance.id,
            instance.step_count,
            instance.state.clone(),
            instance.current_node.clone(),
        )
        .with_suspension(suspension.clone());
        self.inner.checkpoints.save_checkpoint(&checkpoint).await;

        self.apply_suspension(&definition, &mut instance, suspension).await
    }

    /// Deliver a relevant status to the instance behind `polled`.
    ///
    /// Returns false if the instance was no longer waiting on it, or another
    /// pass already handled this due slot.
    pub(crate) async fn deliver_status(
        &self,
        polled: &AsyncWatch,
        status: Value,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let instance_id = polled.instance_id;
        let resource_id = polled.resource_id.as_str();
        {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;

            let Some(mut instance) = self.inner.checkpoints.get_instance(&instance_id).await? else {
                self.inner.watches.remove(instance_id).await?;
                return Ok(false);
            };
            match &instance.blocker {
                Some(Blocker::Watch { resource_id: r }) if r == resource_id => {}
                Some(Blocker::Watch { .. }) => return Ok(false),
                _ => {
                    // the instance moved on; the watch is stale
                    self.inner.watches.remove(instance_id).await?;
                    return Ok(false);
                }
            }
            match self.inner.watches.get(instance_id).await? {
                Some(current) if same_due_slot(&current, polled, now) => {}
                _ => return Ok(false),
            }
            if !self.inner.watches.remove(instance_id).await? {
                return Ok(false);
            }
            let input = ResumeInput::StatusChanged {
                resource_id: resource_id.to_string(),
                status,
            };
            let state = instance.state.clone();
            self.deliver(&mut instance, state, input).await;
        }
        self.drive(instance_id).await?;
        Ok(true)
    }

    /// Record a poll that found nothing relevant; escalate once the attempt
    /// ceiling is reached. A slot another pass already handled is skipped.
    pub(crate) async fn record_unchanged_poll(
        &self,
        polled: &AsyncWatch,
        status: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<PollOutcome, EngineError> {
        let instance_id = polled.instance_id;
        let resource_id = polled.resource_id.as_str();
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut watch = match self.inner.watches.get(instance_id).await? {
            Some(current) if same_due_slot(&current, polled, now) => current,
            _ => return Ok(PollOutcome::Skipped),
        };
        watch.reschedule(now, status);

        let max_attempts = self.inner.watches.config().max_attempts;
        if watch.attempt < max_attempts {
            self.inner.watches.save(&watch).await?;
            let next_poll_in_secs = (watch.next_poll_at - now).num_seconds();
            tracing::debug!(
                instance_id = %instance_id,
                resource_id,
                attempt = watch.attempt,
                next_poll_in_secs,
                "status unchanged, poll rescheduled"
            );
            self.inner.events.publish(EngineEvent::WatchPolled {
                instance_id,
                resource_id: resource_id.to_string(),
                attempt: watch.attempt,
                next_poll_in_secs,
            });
            return Ok(PollOutcome::Rescheduled {
                attempt: watch.attempt,
                next_poll_at: watch.next_poll_at,
            });
        }

        let mut instance = self.load_instance(instance_id).await?;
        let waiting = instance.status == InstanceStatus::Paused
            && matches!(&instance.blocker, Some(Blocker::Watch { resource_id: r }) if r == resource_id);
        if !waiting {
            self.inner.watches.remove(instance_id).await?;
            return Ok(PollOutcome::Skipped);
        }

        let reason = format!("status of {resource_id} unchanged after {} polls", watch.attempt);
        let request = escalation_request(resource_id, watch.attempt, reason);
        let task = self.inner.gate.open_or_adopt(instance_id, request).await?;
        self.inner.watches.remove(instance_id).await?;

        tracing::warn!(
            instance_id = %instance_id,
            resource_id,
            attempts = watch.attempt,
            task_id = %task.id,
            "watch escalated to technical escalation task"
        );
        self.inner.events.publish(EngineEvent::WatchEscalated {
            instance_id,
            resource_id: resource_id.to_string(),
            attempts: watch.attempt,
        });
        let blocker = Blocker::HumanTask {
            task_id: task.id,
            task_type: task.task_type,
        };
        self.pause(&mut instance, blocker, format!("human_task:{}", task.task_type))
            .await;
        Ok(PollOutcome::Escalated { task_id: task.id })
    }

    // -----------------------------------------------------------------------
    // Cancel
    // -----------------------------------------------------------------------

    /// Cancel an instance.
    ///
    /// A running instance stops at its next node boundary. A suspended one is
    /// cancelled at once: its open task is cancelled, its watch removed, and
    /// its fan-out children are cancelled too.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<InstanceStatus, EngineError> {
        self.load_instance(instance_id).await?;
        self.token_for(instance_id).cancel();

        let (status, children) = {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;

            let mut instance = self.load_instance(instance_id).await?;
            if instance.status.is_terminal() {
                (instance.status, Vec::new())
            } else {
                if let Some(task) = self.inner.gate.open_task(instance_id).await? {
                    self.inner.gate.cancel(task.id).await?;
                }
                self.inner.watches.remove(instance_id).await?;

                let mut children = Vec::new();
                if let Some(Blocker::Fanout { fanout_id, .. }) = instance.blocker {
                    if let Some(fanout) = self.inner.runner.get(fanout_id).await? {
                        children = fanout.child_instance_ids.clone();
                        self.inner.runner.finish(fanout_id).await?;
                    }
                }
                (self.mark_cancelled(&mut instance).await, children)
            }
        };
        if status.is_terminal() {
            self.forget(instance_id);
        }

        for child in children {
            if let Err(e) = self.cancel_boxed(child).await {
                tracing::warn!(instance_id = %child, error = %e, "failed to cancel child");
            }
        }
        self.report_if_child(instance_id).await?;
        Ok(status)
    }

    fn cancel_boxed(&self, instance_id: Uuid) -> BoxFuture<'static, Result<InstanceStatus, EngineError>> {
        let engine = self.clone();
        Box::pin(async move { engine.cancel(instance_id).await })
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Status, position and blocker of an instance.
    pub async fn describe(&self, instance_id: Uuid) -> Result<InstanceReport, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        let blocker = match &instance.blocker {
            Some(Blocker::HumanTask { task_id, .. }) => {
                self.inner.gate.get(*task_id).await.ok().map(BlockerDetail::Task)
            }
            Some(Blocker::Watch { .. }) => self
                .inner
                .watches
                .get(instance_id)
                .await?
                .map(BlockerDetail::Watch),
            Some(Blocker::Fanout { fanout_id, .. }) => {
                self.inner.runner.get(*fanout_id).await?.map(|f| {
                    let summary = f.summary();
                    BlockerDetail::Fanout {
                        fanout_id: f.id,
                        expected: f.expected_count,
                        completed: f.completed_count,
                        failed_indices: summary.failed_indices,
                    }
                })
            }
            None => None,
        };

        Ok(InstanceReport {
            instance_id,
            definition_id: instance.definition_id,
            intake_id: instance.intake_id,
            status: instance.status,
            current_node: instance.current_node,
            step_count: instance.step_count,
            error: instance.error,
            blocker,
            durable: !self.inner.checkpoints.is_buffered(&instance_id),
            updated_at: instance.updated_at,
        })
    }

    /// Final or current state of an instance, decoded.
    pub async fn state(&self, instance_id: Uuid) -> Result<P, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        decode(&instance.state)
    }

    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        self.inner.checkpoints.list_instances(status).await
    }

    /// Write checkpoints buffered during a store outage.
    pub async fn flush_checkpoints(&self) -> Result<usize, EngineError> {
        self.inner.checkpoints.flush().await
    }

    /// Whether every record reached the store.
    pub fn is_durable(&self) -> bool {
        self.inner.checkpoints.is_durable()
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Pick up where a crashed process left off.
    ///
    /// Reports terminal children a fan-out never heard about, completes
    /// fan-ins whose counts already reached the total, delivers resolutions of
    /// tasks resolved before the crash, re-registers lost watches, and drives
    /// every RUNNING instance.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        for fanout in self.inner.runner.list().await? {
            let mut ready = fanout.is_complete().then(|| fanout.clone());
            for (index, child_id) in fanout.child_instance_ids.iter().enumerate() {
                if fanout.outcomes.contains_key(&index) {
                    continue;
                }
                let Some(child) = self.inner.checkpoints.get_instance(child_id).await? else {
                    continue;
                };
                let Some(link) = child.parent else {
                    continue;
                };
                if child.status.is_terminal() {
                    if let Some(done) = self
                        .inner
                        .runner
                        .record_completion(fanout.id, child_outcome(&child, &link))
                        .await?
                    {
                        ready = Some(done);
                    }
                }
            }
            if let Some(done) = ready {
                match self.fan_in_boxed(done.parent_instance_id, done.id).await {
                    Ok(Some(_)) => report.fan_ins += 1,
                    Ok(None) => {}
                    Err(e) => report.failed.push((done.parent_instance_id, e.to_string())),
                }
            }
        }

        for instance in self.inner.checkpoints.list_instances(Some(InstanceStatus::Paused)).await? {
            match &instance.blocker {
                Some(Blocker::HumanTask { task_id, .. }) => {
                    let Ok(task) = self.inner.gate.get(*task_id).await else {
                        continue;
                    };
                    if task.status != TaskStatus::Resolved {
                        continue;
                    }
                    match self.redeliver_task(instance.id, &task).await {
                        Ok(true) => report.tasks_delivered += 1,
                        Ok(false) => {}
                        Err(e) => report.failed.push((instance.id, e.to_string())),
                    }
                }
                Some(Blocker::Watch { resource_id }) => {
                    if self.inner.watches.get(instance.id).await?.is_some() {
                        continue;
                    }
                    match self.inner.watches.register(instance.id, resource_id).await {
                        Ok(_) => report.watches_restored += 1,
                        Err(e) => report.failed.push((instance.id, e.to_string())),
                    }
                }
                _ => {}
            }
        }

        let mut runs = JoinSet::new();
        for instance in self.inner.checkpoints.list_instances(Some(InstanceStatus::Running)).await? {
            let id = instance.id;
            let slots = instance.parent.map(|_| self.inner.runner.slots());
            let run = self.drive_boxed(id);
            runs.spawn(async move {
                let _slot = match slots {
                    Some(slots) => slots.acquire_owned().await.ok(),
                    None => None,
                };
                (id, run.await)
            });
        }
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.resumed.push(id),
                Ok((id, Err(e))) => report.failed.push((id, e.to_string())),
                Err(e) => tracing::warn!(error = %e, "recovery run panicked"),
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            fan_ins = report.fan_ins,
            tasks_delivered = report.tasks_delivered,
            watches_restored = report.watches_restored,
            failed = report.failed.len(),
            "recovery finished"
        );
        Ok(report)
    }

    async fn redeliver_task(&self, instance_id: Uuid, task: &HumanTask) -> Result<bool, EngineError> {
        {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;
            let mut instance = self.load_instance(instance_id).await?;
            if !self.deliver_task(&mut instance, task).await {
                return Ok(false);
            }
        }
        self.drive(instance_id).await?;
        Ok(true)
    }
}

impl<S: EngineStore, P: WorkflowState> std::fmt::Debug for WorkflowEngine<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("definitions", &self.inner.registry.ids())
            .field("durable", &self.inner.checkpoints.is_durable())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn encode<P: WorkflowState>(state: &P) -> Result<Value, EngineError> {
    serde_json::to_value(state).map_err(|e| EngineError::Validation(format!("state does not serialize: {e}")))
}

/// Deserialize and validate a stored state.
fn decode<P: WorkflowState>(value: &Value) -> Result<P, EngineError> {
    let state: P = serde_json::from_value(value.clone())
        .map_err(|e| EngineError::Validation(format!("state does not match payload shape: {e}")))?;
    check_state(&state)?;
    Ok(state)
}

fn check_state<P: WorkflowState>(state: &P) -> Result<(), EngineError> {
    state
        .validate()
        .map_err(|e| EngineError::Validation(format!("invalid {} state: {e}", state.stage())))
}

fn require_kind<P>(node: &NodeSpec<P>, kind: NodeKind, action: &str) -> Result<(), EngineError> {
    if node.kind != kind {
        return Err(EngineError::InvalidState(format!(
            "node '{}' of kind {:?} cannot {action}",
            node.id, node.kind
        )));
    }
    Ok(())
}

/// Node a suspended instance resumes at: the suspending node itself, or a
/// declared edge target.
fn resume_target<P>(
    definition: &WorkflowDefinition<P>,
    from: &str,
    resume_at: Option<String>,
) -> Result<String, EngineError> {
    match resume_at {
        None => Ok(from.to_string()),
        Some(to) if definition.allows_jump(from, &to) => Ok(to),
        Some(to) => Err(EngineError::Routing {
            node: from.to_string(),
            reason: format!("cannot resume at '{to}' without an edge"),
        }),
    }
}

fn child_outcome(child: &WorkflowInstance, link: &ParentLink) -> ChildOutcome {
    let completed = child.status == InstanceStatus::Completed;
    ChildOutcome {
        index: link.index,
        child_instance_id: child.id,
        status: child.status,
        state: completed.then(|| child.state.clone()),
        error: child.error.clone(),
    }
}

fn child_result<P: WorkflowState>(outcome: ChildOutcome) -> Result<P, String> {
    if !outcome.succeeded() {
        return Err(outcome
            .error
            .unwrap_or_else(|| format!("child {}", outcome.status.as_str())));
    }
    match outcome.state {
        Some(value) => decode(&value).map_err(|e| e.to_string()),
        None => Err("child completed without a state".to_string()),
    }
}

fn escalation_request(resource_id: &str, attempts: u32, reason: String) -> TaskRequest {
    TaskRequest::new(
        format!("Status check for {resource_id} needs attention"),
        TaskPayload::TechnicalEscalation {
            reason,
            resource_id: Some(resource_id.to_string()),
            attempts,
        },
    )
    .with_priority(TaskPriority::High)
}
