//! Async event bridge: polls external status for suspended instances.
//!
//! An instance waiting on an external resource (a payer submission, say) has
//! one `AsyncWatch`. The bridge ticks, picks the due watches, and asks the
//! configured status tool for each resource:
//!
//! - a relevant status resumes the instance with that status as input
//! - anything else reschedules the watch with exponential backoff
//!   (2s, 4s, 8s, ... capped at the configured maximum)
//! - after `max_attempts` unchanged polls the watch becomes a
//!   TECHNICAL_ESCALATION task and the instance waits on that instead

use std::sync::Arc;
use std::time::Duration;

use authflow_types::config::WatchConfig;
use authflow_types::event::EngineEvent;
use authflow_types::payload::WorkflowState;
use authflow_types::watch::AsyncWatch;
use authflow_types::workflow::InstanceStatus;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::EngineStore;
use crate::repository::watch::WatchStore;

use super::error::EngineError;
use super::executor::WorkflowEngine;
use super::tool::ToolCall;

/// Watches polled per tick.
const POLL_BATCH: usize = 64;

// ---------------------------------------------------------------------------
// WatchRegistry
// ---------------------------------------------------------------------------

/// Persistent registry of status watches, one per instance.
pub struct WatchRegistry<S: WatchStore> {
    store: Arc<S>,
    events: EventBus,
    config: WatchConfig,
    /// Instances whose watch is being polled right now.
    in_flight: Arc<DashSet<Uuid>>,
}

/// Exclusive right to poll one instance's watch; released on drop.
pub(crate) struct PollClaim {
    instance_id: Uuid,
    in_flight: Arc<DashSet<Uuid>>,
}

impl Drop for PollClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.instance_id);
    }
}

impl<S: WatchStore> WatchRegistry<S> {
    pub fn new(store: Arc<S>, events: EventBus, config: WatchConfig) -> Self {
        Self {
            store,
            events,
            config,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Register a watch for `instance_id` on `resource_id`.
    ///
    /// An existing watch on the same resource is returned untouched, so a
    /// re-applied suspension keeps its backoff progress. Fails with
    /// `WatchCapacityExceeded` when the registry is full.
    pub async fn register(&self, instance_id: Uuid, resource_id: &str) -> Result<AsyncWatch, EngineError> {
        let existing = self.store.get_watch(&instance_id).await?;
        if let Some(watch) = existing.as_ref().filter(|w| w.resource_id == resource_id) {
            tracing::debug!(instance_id = %instance_id, resource_id, "adopting existing watch");
            return Ok(watch.clone());
        }
        if existing.is_none() && self.store.count_watches().await? >= self.config.max_watches {
            return Err(EngineError::WatchCapacityExceeded(self.config.max_watches));
        }

        let watch = AsyncWatch::new(
            instance_id,
            resource_id,
            self.config.backoff_base_secs,
            self.config.max_interval_secs,
            Utc::now(),
        );
        self.store.upsert_watch(&watch).await?;

        tracing::info!(
            instance_id = %instance_id,
            resource_id,
            next_poll_at = %watch.next_poll_at,
            "watch registered"
        );
        self.events.publish(EngineEvent::WatchRegistered {
            instance_id,
            resource_id: resource_id.to_string(),
        });
        Ok(watch)
    }

    /// Remove the watch of `instance_id`. Returns `true` only for the caller
    /// that removed it.
    pub async fn remove(&self, instance_id: Uuid) -> Result<bool, EngineError> {
        Ok(self.store.remove_watch(&instance_id).await?)
    }

    pub async fn get(&self, instance_id: Uuid) -> Result<Option<AsyncWatch>, EngineError> {
        Ok(self.store.get_watch(&instance_id).await?)
    }

    pub async fn save(&self, watch: &AsyncWatch) -> Result<(), EngineError> {
        Ok(self.store.upsert_watch(watch).await?)
    }

    /// Watches due at `now`, earliest first.
    pub async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AsyncWatch>, EngineError> {
        Ok(self.store.due_watches(now, limit).await?)
    }

    pub async fn count(&self) -> Result<usize, EngineError> {
        Ok(self.store.count_watches().await?)
    }

    /// Claim the watch of `instance_id` for one poll. `None` while another
    /// pass holds it.
    pub(crate) fn claim(&self, instance_id: Uuid) -> Option<PollClaim> {
        self.in_flight.insert(instance_id).then(|| PollClaim {
            instance_id,
            in_flight: self.in_flight.clone(),
        })
    }
}

/// Whether `current` is still the due slot a pass picked up as `polled`.
pub(crate) fn same_due_slot(current: &AsyncWatch, polled: &AsyncWatch, now: DateTime<Utc>) -> bool {
    current.resource_id == polled.resource_id && current.attempt == polled.attempt && current.is_due(now)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Decides whether a status returned by the status tool is relevant.
pub type StatusClassifier = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Relevant when the result carries a `status` other than `"pending"`.
pub fn default_classifier() -> StatusClassifier {
    Arc::new(|value: &Value| match value.get("status") {
        Some(Value::String(status)) => !status.eq_ignore_ascii_case("pending"),
        Some(Value::Null) | None => false,
        Some(_) => true,
    })
}

/// What happened to one due watch.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A relevant status was delivered and the instance resumed.
    Changed,
    Rescheduled {
        attempt: u32,
        next_poll_at: DateTime<Utc>,
    },
    /// Attempts ran out; the instance now waits on this task.
    Escalated { task_id: Uuid },
    /// The watch was gone or stale by the time it was handled.
    Skipped,
}

/// Totals of one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub changed: usize,
    pub rescheduled: usize,
    pub escalated: usize,
    pub errors: usize,
}

impl PollReport {
    fn add(&mut self, outcome: &PollOutcome) {
        match outcome {
            PollOutcome::Changed => self.changed += 1,
            PollOutcome::Rescheduled { .. } => self.rescheduled += 1,
            PollOutcome::Escalated { .. } => self.escalated += 1,
            PollOutcome::Skipped => {}
        }
    }
}

// ---------------------------------------------------------------------------
// AsyncEventBridge
// ---------------------------------------------------------------------------

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background poller feeding external status changes into the engine.
pub struct AsyncEventBridge<S: EngineStore, P: WorkflowState> {
    engine: WorkflowEngine<S, P>,
    classifier: StatusClassifier,
    ticker: Arc<RwLock<Option<Ticker>>>,
}

impl<S: EngineStore, P: WorkflowState> AsyncEventBridge<S, P> {
    pub fn new(engine: WorkflowEngine<S, P>) -> Self {
        Self {
            engine,
            classifier: default_classifier(),
            ticker: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Suspend `instance_id` until `resource_id` reports a relevant status.
    pub async fn watch(&self, instance_id: Uuid, resource_id: &str) -> Result<InstanceStatus, EngineError> {
        self.engine.watch(instance_id, resource_id).await
    }

    /// Poll every watch due at `now` once.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Result<PollReport, EngineError> {
        let due = self.engine.watches().due(now, POLL_BATCH).await?;
        let mut report = PollReport {
            polled: due.len(),
            ..PollReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let status_tool = self.engine.config().watch.status_tool.clone();
        let mut polls = JoinSet::new();
        for watch in due {
            let engine = self.engine.clone();
            let classifier = self.classifier.clone();
            let tool = status_tool.clone();
            polls.spawn(async move { poll_one(engine, classifier, tool, watch, now).await });
        }

        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.add(&outcome),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "watch poll failed");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "watch poll panicked");
                    report.errors += 1;
                }
            }
        }

        tracing::debug!(
            polled = report.polled,
            changed = report.changed,
            rescheduled = report.rescheduled,
            escalated = report.escalated,
            errors = report.errors,
            "poll pass finished"
        );
        Ok(report)
    }

    /// Start polling on the configured tick. A second call is a no-op.
    pub async fn start(&self) {
        let mut ticker = self.ticker.write().await;
        if ticker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let bridge = Self {
            engine: self.engine.clone(),
            classifier: self.classifier.clone(),
            ticker: Arc::new(RwLock::new(None)),
        };
        let tick = Duration::from_millis(self.engine.config().watch.tick_interval_ms.max(1));
        let child = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = bridge.poll_due(Utc::now()).await {
                            tracing::warn!(error = %e, "poll pass failed");
                        }
                    }
                }
            }
        });

        *ticker = Some(Ticker { token, handle });
        tracing::info!(tick_ms = tick.as_millis() as u64, "event bridge started");
    }

    /// Stop polling and wait for the current pass to finish.
    pub async fn stop(&self) {
        let ticker = self.ticker.write().await.take();
        if let Some(ticker) = ticker {
            ticker.token.cancel();
            if let Err(e) = ticker.handle.await {
                tracing::warn!(error = %e, "event bridge task ended abnormally");
            }
            tracing::info!("event bridge stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.ticker.read().await.is_some()
    }
}

async fn poll_one<S: EngineStore, P: WorkflowState>(
    engine: WorkflowEngine<S, P>,
    classifier: StatusClassifier,
    status_tool: String,
    watch: AsyncWatch,
    now: DateTime<Utc>,
) -> Result<PollOutcome, EngineError> {
    let Some(_claim) = engine.watches().claim(watch.instance_id) else {
        return Ok(PollOutcome::Skipped);
    };
    // an overlapping pass may have handled this slot already
    match engine.watches().get(watch.instance_id).await? {
        Some(current) if same_due_slot(&current, &watch, now) => {}
        _ => return Ok(PollOutcome::Skipped),
    }

    let call = ToolCall::new(status_tool, json!({ "resource_id": watch.resource_id }));
    let status = match engine.tools().invoke(call).await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(
                instance_id = %watch.instance_id,
                resource_id = watch.resource_id.as_str(),
                error = %e,
                "status check failed, counting as unchanged"
            );
            None
        }
    };

    if let Some(status) = status.as_ref().filter(|s| classifier(s)) {
        tracing::info!(
            instance_id = %watch.instance_id,
            resource_id = watch.resource_id.as_str(),
            "relevant status received"
        );
        let delivered = engine
            .deliver_status(&watch, status.clone(), now)
            .await?;
        return Ok(if delivered {
            PollOutcome::Changed
        } else {
            PollOutcome::Skipped
        });
    }

    engine
        .record_unchanged_poll(&watch, status, now)
        .await
}
