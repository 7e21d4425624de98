//! Sub-workflow fan-out bookkeeping.
//!
//! A `SubworkflowFanout` tracks the children spawned by one fan-out node. Child
//! outcomes are keyed by item index, which makes completion reports idempotent
//! and fixes the aggregation order to the order the items were declared in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::InstanceStatus;

/// Terminal outcome of one child instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub index: usize,
    pub child_instance_id: Uuid,
    pub status: InstanceStatus,
    /// Final state for completed children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChildOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == InstanceStatus::Completed
    }
}

/// Result of reporting a child completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First report for this index. `ready` is true for exactly one report:
    /// the one that brought `completed_count` up to `expected_count`.
    Recorded { ready: bool },
    /// The index already reported; nothing changed.
    Duplicate,
    /// The index is outside the fan-out.
    UnknownIndex,
}

/// Summary handed to the fan-in node alongside the merged state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanInSummary {
    pub fanout_id: Uuid,
    pub expected: usize,
    pub succeeded: usize,
    /// Indices (declaration order) of children that did not complete.
    pub failed_indices: Vec<usize>,
}

/// A fan-out in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubworkflowFanout {
    pub id: Uuid,
    pub parent_instance_id: Uuid,
    /// Node of the parent that spawned the fan-out.
    pub node_id: String,
    pub child_definition_id: String,
    /// Child instance ids in item declaration order.
    pub child_instance_ids: Vec<Uuid>,
    pub expected_count: usize,
    pub completed_count: usize,
    /// Aggregation state: outcomes so far, by item index.
    pub outcomes: BTreeMap<usize, ChildOutcome>,
    pub created_at: DateTime<Utc>,
}

impl SubworkflowFanout {
    pub fn new(
        parent_instance_id: Uuid,
        node_id: impl Into<String>,
        child_definition_id: impl Into<String>,
        child_instance_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            parent_instance_id,
            node_id: node_id.into(),
            child_definition_id: child_definition_id.into(),
            expected_count: child_instance_ids.len(),
            child_instance_ids,
            completed_count: 0,
            outcomes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count >= self.expected_count
    }

    /// Record a child outcome, ignoring repeats for the same index.
    pub fn record(&mut self, outcome: ChildOutcome) -> RecordOutcome {
        if outcome.index >= self.expected_count {
            return RecordOutcome::UnknownIndex;
        }
        if self.outcomes.contains_key(&outcome.index) {
            return RecordOutcome::Duplicate;
        }
        self.outcomes.insert(outcome.index, outcome);
        self.completed_count = self.outcomes.len();
        RecordOutcome::Recorded {
            ready: self.completed_count == self.expected_count,
        }
    }

    /// Outcomes in declaration order.
    pub fn ordered_outcomes(&self) -> Vec<ChildOutcome> {
        self.outcomes.values().cloned().collect()
    }

    pub fn summary(&self) -> FanInSummary {
        let failed_indices: Vec<usize> = self
            .outcomes
            .values()
            .filter(|o| !o.succeeded())
            .map(|o| o.index)
            .collect();
        FanInSummary {
            fanout_id: self.id,
            expected: self.expected_count,
            succeeded: self.outcomes.len() - failed_indices.len(),
            failed_indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(index: usize, ok: bool) -> ChildOutcome {
        ChildOutcome {
            index,
            child_instance_id: Uuid::now_v7(),
            status: if ok {
                InstanceStatus::Completed
            } else {
                InstanceStatus::Failed
            },
            state: ok.then(|| json!({"index": index})),
            error: (!ok).then(|| "lookup failed".to_string()),
        }
    }

    fn fanout(n: usize) -> SubworkflowFanout {
        let ids = (0..n).map(|_| Uuid::now_v7()).collect();
        SubworkflowFanout::new(Uuid::now_v7(), "gather", "gather-item", ids)
    }

    #[test]
    fn test_ready_fires_exactly_once_under_duplicates() {
        let mut f = fanout(3);
        let mut ready_count = 0;
        for index in [2, 0, 2, 1, 0, 1, 2] {
            if let RecordOutcome::Recorded { ready: true } = f.record(outcome(index, true)) {
                ready_count += 1;
            }
        }
        assert_eq!(ready_count, 1);
        assert_eq!(f.completed_count, 3);
        assert!(f.is_complete());
    }

    #[test]
    fn test_duplicate_and_unknown_index() {
        let mut f = fanout(2);
        assert_eq!(f.record(outcome(0, true)), RecordOutcome::Recorded { ready: false });
        assert_eq!(f.record(outcome(0, false)), RecordOutcome::Duplicate);
        assert_eq!(f.record(outcome(5, true)), RecordOutcome::UnknownIndex);
        assert_eq!(f.completed_count, 1);
        // first report wins
        assert!(f.outcomes[&0].succeeded());
    }

    #[test]
    fn test_outcomes_follow_declaration_order() {
        let mut f = fanout(4);
        for index in [3, 1, 0, 2] {
            f.record(outcome(index, index != 1));
        }
        let order: Vec<usize> = f.ordered_outcomes().iter().map(|o| o.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_summary_flags_failures() {
        let mut f = fanout(5);
        for index in 0..5 {
            f.record(outcome(index, index % 2 == 0));
        }
        let summary = f.summary();
        assert_eq!(summary.expected, 5);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed_indices, vec![1, 3]);
    }

    #[test]
    fn test_empty_fanout_is_complete() {
        let f = fanout(0);
        assert!(f.is_complete());
        assert_eq!(f.summary().succeeded, 0);
    }
}
