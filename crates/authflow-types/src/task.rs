//! Human task types.
//!
//! A `HumanTask` blocks exactly one workflow instance until a person resolves
//! it. The payload variant fixes the task type, so a task can never carry a
//! payload shaped for a different kind of review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::decision::RecommendedAction;
use crate::error::TaskPayloadError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of human review a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    RequireDocuments,
    AppealReview,
    AmbiguousResponse,
    TechnicalEscalation,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::RequireDocuments => "require_documents",
            TaskType::AppealReview => "appeal_review",
            TaskType::AmbiguousResponse => "ambiguous_response",
            TaskType::TechnicalEscalation => "technical_escalation",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "require_documents" => Ok(TaskType::RequireDocuments),
            "appeal_review" => Ok(TaskType::AppealReview),
            "ambiguous_response" => Ok(TaskType::AmbiguousResponse),
            "technical_escalation" => Ok(TaskType::TechnicalEscalation),
            other => Err(format!("invalid task type: {other}")),
        }
    }
}

/// Task lifecycle. `Cancelled` is only reached when the owning instance is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Resolved,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Resolved => "resolved",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "resolved" => Ok(TaskStatus::Resolved),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// How urgently a reviewer should pick up a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A document or data item the reviewer is asked to supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-type payload of a human task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Required documentation could not be gathered automatically.
    RequireDocuments { missing: Vec<MissingItem> },
    /// A denial is worth appealing; a reviewer signs off on the appeal.
    AppealReview {
        denial_reason: String,
        #[serde(default)]
        supporting_evidence: Vec<String>,
    },
    /// Reasoning could not decide with enough confidence.
    AmbiguousResponse {
        summary: String,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommended_action: Option<RecommendedAction>,
    },
    /// Automation gave up on an external dependency.
    TechnicalEscalation {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<String>,
        #[serde(default)]
        attempts: u32,
    },
}

impl TaskPayload {
    /// The task type this payload belongs to.
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::RequireDocuments { .. } => TaskType::RequireDocuments,
            TaskPayload::AppealReview { .. } => TaskType::AppealReview,
            TaskPayload::AmbiguousResponse { .. } => TaskType::AmbiguousResponse,
            TaskPayload::TechnicalEscalation { .. } => TaskType::TechnicalEscalation,
        }
    }

    /// Check the fixed per-type schema beyond what serde enforces.
    pub fn validate(&self) -> Result<(), TaskPayloadError> {
        match self {
            TaskPayload::RequireDocuments { missing } => {
                if missing.is_empty() {
                    return Err(TaskPayloadError::InvalidField {
                        field: "missing",
                        reason: "at least one item is required".to_string(),
                    });
                }
                if missing.iter().any(|m| m.name.trim().is_empty()) {
                    return Err(TaskPayloadError::InvalidField {
                        field: "missing",
                        reason: "item names must not be blank".to_string(),
                    });
                }
            }
            TaskPayload::AppealReview { denial_reason, .. } => {
                if denial_reason.trim().is_empty() {
                    return Err(TaskPayloadError::InvalidField {
                        field: "denial_reason",
                        reason: "must not be blank".to_string(),
                    });
                }
            }
            TaskPayload::AmbiguousResponse { confidence, .. } => {
                if !(0.0..=1.0).contains(confidence) {
                    return Err(TaskPayloadError::InvalidField {
                        field: "confidence",
                        reason: format!("{confidence} is outside [0, 1]"),
                    });
                }
            }
            TaskPayload::TechnicalEscalation { reason, .. } => {
                if reason.trim().is_empty() {
                    return Err(TaskPayloadError::InvalidField {
                        field: "reason",
                        reason: "must not be blank".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check that this payload is shaped for `expected`.
    pub fn ensure_type(&self, expected: TaskType) -> Result<(), TaskPayloadError> {
        let actual = self.task_type();
        if actual != expected {
            return Err(TaskPayloadError::TypeMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request and record
// ---------------------------------------------------------------------------

/// What a pausing node asks the gate to open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub payload: TaskPayload,
    pub title: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

impl TaskRequest {
    pub fn new(title: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            payload,
            title: title.into(),
            priority: TaskPriority::default(),
            assigned_to: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn assigned_to(mut self, assignee: impl Into<String>) -> Self {
        self.assigned_to = Some(assignee.into());
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }
}

/// A persisted human task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub task_type: TaskType,
    pub title: String,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    /// Opaque resolution content, handed to the resuming node unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HumanTask {
    /// Build an OPEN task for `instance_id` from a request.
    pub fn open(instance_id: Uuid, request: TaskRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            task_type: request.payload.task_type(),
            title: request.title,
            payload: request.payload,
            priority: request.priority,
            assigned_to: request.assigned_to,
            status: TaskStatus::Open,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
