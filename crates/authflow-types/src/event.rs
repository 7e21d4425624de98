//! Engine event types.
//!
//! `EngineEvent` is broadcast on the engine's event bus. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskType;

/// Events emitted while instances advance, suspend and resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: Uuid,
        definition_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_instance_id: Option<Uuid>,
    },

    /// A node finished and its checkpoint was taken.
    NodeCompleted {
        instance_id: Uuid,
        node: String,
        step: u32,
        durable: bool,
    },

    InstancePaused {
        instance_id: Uuid,
        node: String,
        reason: String,
    },

    InstanceResumed { instance_id: Uuid, node: String },

    InstanceCompleted { instance_id: Uuid, steps: u32 },

    InstanceFailed { instance_id: Uuid, error: String },

    InstanceCancelled { instance_id: Uuid },

    TaskOpened {
        task_id: Uuid,
        instance_id: Uuid,
        task_type: TaskType,
    },

    TaskResolved { task_id: Uuid, instance_id: Uuid },

    WatchRegistered {
        instance_id: Uuid,
        resource_id: String,
    },

    /// A poll came back with nothing relevant.
    WatchPolled {
        instance_id: Uuid,
        resource_id: String,
        attempt: u32,
        next_poll_in_secs: i64,
    },

    WatchEscalated {
        instance_id: Uuid,
        resource_id: String,
        attempts: u32,
    },

    FanoutStarted {
        fanout_id: Uuid,
        parent_instance_id: Uuid,
        expected: usize,
    },

    ChildCompleted {
        fanout_id: Uuid,
        index: usize,
        succeeded: bool,
        completed: usize,
        expected: usize,
    },

    /// A checkpoint save failed; the instance is running without crash safety.
    PersistenceDegraded { instance_id: Uuid, error: String },

    /// Buffered checkpoints were written after an earlier failure.
    PersistenceRestored { flushed: usize },
}

impl EngineEvent {
    /// The instance the event concerns, if any.
    pub fn instance_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::NodeCompleted { instance_id, .. }
            | EngineEvent::InstancePaused { instance_id, .. }
            | EngineEvent::InstanceResumed { instance_id, .. }
            | EngineEvent::InstanceCompleted { instance_id, .. }
            | EngineEvent::InstanceFailed { instance_id, .. }
            | EngineEvent::InstanceCancelled { instance_id }
            | EngineEvent::TaskOpened { instance_id, .. }
            | EngineEvent::TaskResolved { instance_id, .. }
            | EngineEvent::WatchRegistered { instance_id, .. }
            | EngineEvent::WatchPolled { instance_id, .. }
            | EngineEvent::WatchEscalated { instance_id, .. }
            | EngineEvent::PersistenceDegraded { instance_id, .. } => Some(*instance_id),
            EngineEvent::FanoutStarted {
                parent_instance_id, ..
            } => Some(*parent_instance_id),
            EngineEvent::ChildCompleted { .. } | EngineEvent::PersistenceRestored { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = EngineEvent::WatchEscalated {
            instance_id: Uuid::nil(),
            resource_id: "SUB-1".to_string(),
            attempts: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "watch_escalated");
        assert_eq!(json["attempts"], 5);
        let parsed: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_instance_id_accessor() {
        let id = Uuid::now_v7();
        assert_eq!(
            EngineEvent::InstanceCancelled { instance_id: id }.instance_id(),
            Some(id)
        );
        assert_eq!(EngineEvent::PersistenceRestored { flushed: 2 }.instance_id(), None);
    }
}
