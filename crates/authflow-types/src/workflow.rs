//! Workflow instance and checkpoint types.
//!
//! A `WorkflowInstance` is one execution of a workflow definition. Its durable
//! history is a sequence of `Checkpoint`s, each taken after a node completed and
//! before the next node starts. Suspended instances record what blocks them
//! (`Blocker`) and, once unblocked, what they were resumed with (`ResumeInput`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fanout::FanInSummary;
use crate::task::{TaskRequest, TaskType};

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// The kind of a node in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Plain step: runs its handler and routes on.
    Sequential,
    /// Branch point driven by a confidence-gated decision policy.
    Decision,
    /// Fans out child instances and resumes at a fan-in node.
    Subworkflow,
    /// Suspends for human input or an external status change.
    Pause,
}

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Whether the instance can never advance again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Stable lowercase name, as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(InstanceStatus::Running),
            "paused" => Ok(InstanceStatus::Paused),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("invalid instance status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Suspension bookkeeping
// ---------------------------------------------------------------------------

/// What currently blocks a paused instance. Exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Blocker {
    /// Waiting for a human task to be resolved.
    HumanTask { task_id: Uuid, task_type: TaskType },
    /// Waiting for an external resource to change status.
    Watch { resource_id: String },
    /// Waiting for child instances to finish.
    Fanout { fanout_id: Uuid, expected: usize },
}

/// A suspension requested by a node, recorded write-ahead in the checkpoint.
///
/// If the process dies after the checkpoint is saved but before the side
/// effect lands (task created, watch registered, children spawned), the
/// executor re-applies the suspension on recovery instead of re-running the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suspension {
    HumanTask { request: TaskRequest },
    Watch { resource_id: String },
    /// Items for the children of sub-workflow node `node`.
    Fanout { node: String, items: Vec<Value> },
}

/// Input handed to the node an instance resumes at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeInput {
    /// A human task was resolved; `resolution` is passed through untouched.
    TaskResolved {
        task_id: Uuid,
        task_type: TaskType,
        resolution: Value,
    },
    /// A watched external resource reported a relevant status.
    StatusChanged { resource_id: String, status: Value },
    /// All children of a fan-out finished; the state already holds the merge.
    FanIn(FanInSummary),
}

/// Link from a child instance back to the fan-out that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub parent_instance_id: Uuid,
    pub fanout_id: Uuid,
    /// Position of this child's item in the fan-out's declaration order.
    pub index: usize,
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// ID of the definition being executed.
    pub definition_id: String,
    /// Intake identifier the instance was launched for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intake_id: Option<String>,
    /// Node that runs next (None once completed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    /// Latest serialized state payload.
    pub state: Value,
    pub status: InstanceStatus,
    /// Number of node executions so far.
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<Blocker>,
    /// Kept until the resumed node completes so a crash re-delivers it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_input: Option<ResumeInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    /// Recorded error for FAILED instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a fresh RUNNING instance positioned at `entry`.
    pub fn new(definition_id: impl Into<String>, entry: impl Into<String>, state: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            intake_id: None,
            current_node: Some(entry.into()),
            state,
            status: InstanceStatus::Running,
            step_count: 0,
            blocker: None,
            resume_input: None,
            parent: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to a new status, stamping `updated_at` (and `completed_at` when terminal).
    pub fn transition(&mut self, status: InstanceStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
            self.blocker = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of an instance between two nodes.
///
/// Always a copy: never aliased with the live instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: Uuid,
    pub step_count: u32,
    /// Serialized state payload after the last completed node.
    pub state: Value,
    /// Node to run next (None once the instance completed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_node: Option<String>,
    /// Suspension still to be applied, if the node asked for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        instance_id: Uuid,
        step_count: u32,
        state: Value,
        pending_node: Option<String>,
    ) -> Self {
        Self {
            instance_id,
            step_count,
            state,
            pending_node,
            suspension: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_suspension(mut self, suspension: Suspension) -> Self {
        self.suspension = Some(suspension);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
