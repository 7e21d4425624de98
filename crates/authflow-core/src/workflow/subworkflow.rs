//! Sub-workflow fan-out bookkeeping and child concurrency.
//!
//! The runner owns the `SubworkflowFanout` records and the semaphore bounding
//! how many children step at once. Child completions are serialised per
//! fan-out and deduplicated by item index, so the fan-in fires exactly once
//! no matter how often a child reports.

use std::sync::Arc;

use authflow_types::event::EngineEvent;
use authflow_types::fanout::{ChildOutcome, RecordOutcome, SubworkflowFanout};
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::fanout::FanoutStore;

use super::error::EngineError;

pub struct SubworkflowRunner<S: FanoutStore> {
    store: Arc<S>,
    events: EventBus,
    slots: Arc<Semaphore>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S: FanoutStore> SubworkflowRunner<S> {
    pub fn new(store: Arc<S>, events: EventBus, max_concurrency: usize) -> Self {
        Self {
            store,
            events,
            slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
            locks: DashMap::new(),
        }
    }

    /// Semaphore a child must hold while it steps.
    pub fn slots(&self) -> Arc<Semaphore> {
        self.slots.clone()
    }

    fn lock_for(&self, fanout_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(fanout_id).or_default().clone()
    }

    /// Persist a new fan-out record.
    pub async fn begin(&self, fanout: &SubworkflowFanout) -> Result<(), EngineError> {
        self.store.save_fanout(fanout).await?;
        tracing::info!(
            fanout_id = %fanout.id,
            parent_instance_id = %fanout.parent_instance_id,
            node = fanout.node_id.as_str(),
            expected = fanout.expected_count,
            "fan-out started"
        );
        self.events.publish(EngineEvent::FanoutStarted {
            fanout_id: fanout.id,
            parent_instance_id: fanout.parent_instance_id,
            expected: fanout.expected_count,
        });
        Ok(())
    }

    pub async fn get(&self, fanout_id: Uuid) -> Result<Option<SubworkflowFanout>, EngineError> {
        Ok(self.store.get_fanout(&fanout_id).await?)
    }

    /// The fan-out a parent is waiting on, if any.
    pub async fn for_parent(
        &self,
        parent_instance_id: Uuid,
    ) -> Result<Option<SubworkflowFanout>, EngineError> {
        Ok(self.store.fanout_for_parent(&parent_instance_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<SubworkflowFanout>, EngineError> {
        Ok(self.store.list_fanouts().await?)
    }

    /// Record a child's terminal outcome.
    ///
    /// Returns the fan-out when this report completed it; `None` for every
    /// other report, including duplicates and reports for consumed fan-outs.
    pub async fn record_completion(
        &self,
        fanout_id: Uuid,
        outcome: ChildOutcome,
    ) -> Result<Option<SubworkflowFanout>, EngineError> {
        let lock = self.lock_for(fanout_id);
        let _guard = lock.lock().await;

        let Some(mut fanout) = self.store.get_fanout(&fanout_id).await? else {
            tracing::debug!(fanout_id = %fanout_id, index = outcome.index, "fan-out already consumed");
            return Ok(None);
        };

        let index = outcome.index;
        let succeeded = outcome.succeeded();
        match fanout.record(outcome) {
            RecordOutcome::Duplicate => {
                tracing::warn!(fanout_id = %fanout_id, index, "duplicate child completion dropped");
                Ok(None)
            }
            RecordOutcome::UnknownIndex => {
                tracing::warn!(
                    fanout_id = %fanout_id,
                    index,
                    expected = fanout.expected_count,
                    "child completion for unknown index dropped"
                );
                Ok(None)
            }
            RecordOutcome::Recorded { ready } => {
                self.store.save_fanout(&fanout).await?;
                tracing::debug!(
                    fanout_id = %fanout_id,
                    index,
                    succeeded,
                    completed = fanout.completed_count,
                    expected = fanout.expected_count,
                    "child completion recorded"
                );
                self.events.publish(EngineEvent::ChildCompleted {
                    fanout_id,
                    index,
                    succeeded,
                    completed: fanout.completed_count,
                    expected: fanout.expected_count,
                });
                Ok(ready.then_some(fanout))
            }
        }
    }

    /// Drop a consumed or abandoned fan-out.
    pub async fn finish(&self, fanout_id: Uuid) -> Result<bool, EngineError> {
        let removed = self.store.delete_fanout(&fanout_id).await?;
        self.locks.remove(&fanout_id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStore;
    use authflow_types::workflow::InstanceStatus;
    use serde_json::json;

    fn runner() -> SubworkflowRunner<InMemoryStore> {
        SubworkflowRunner::new(Arc::new(InMemoryStore::new()), EventBus::default(), 2)
    }

    fn outcome(fanout: &SubworkflowFanout, index: usize, ok: bool) -> ChildOutcome {
        ChildOutcome {
            index,
            child_instance_id: fanout.child_instance_ids[index],
            status: if ok {
                InstanceStatus::Completed
            } else {
                InstanceStatus::Failed
            },
            state: ok.then(|| json!({"item": index})),
            error: (!ok).then(|| "lookup failed".to_string()),
        }
    }

    #[tokio::test]
    async fn test_ready_exactly_once_under_duplicates() {
        let runner = Arc::new(runner());
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::now_v7()).collect();
        let fanout = SubworkflowFanout::new(Uuid::now_v7(), "gather", "gather_item", ids);
        runner.begin(&fanout).await.unwrap();

        // every child reports three times, concurrently
        let mut handles = Vec::new();
        for round in 0..3 {
            for index in 0..5 {
                let runner = runner.clone();
                let report = outcome(&fanout, index, index % 2 == 0 || round > 0);
                let fanout_id = fanout.id;
                handles.push(tokio::spawn(async move {
                    runner.record_completion(fanout_id, report).await.unwrap()
                }));
            }
        }
        let mut ready = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);

        let stored = runner.get(fanout.id).await.unwrap().unwrap();
        assert_eq!(stored.completed_count, 5);
        assert_eq!(stored.ordered_outcomes().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_index_and_consumed_fanout() {
        let runner = runner();
        let fanout = SubworkflowFanout::new(Uuid::now_v7(), "gather", "gather_item", vec![Uuid::now_v7()]);
        runner.begin(&fanout).await.unwrap();

        let mut stray = outcome(&fanout, 0, true);
        stray.index = 9;
        assert!(runner.record_completion(fanout.id, stray).await.unwrap().is_none());

        let done = runner
            .record_completion(fanout.id, outcome(&fanout, 0, false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.summary().failed_indices, vec![0]);

        assert!(runner.finish(fanout.id).await.unwrap());
        assert!(runner
            .record_completion(fanout.id, outcome(&fanout, 0, true))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_for_parent() {
        let runner = runner();
        let parent = Uuid::now_v7();
        assert!(runner.for_parent(parent).await.unwrap().is_none());
        let fanout = SubworkflowFanout::new(parent, "gather", "gather_item", vec![]);
        runner.begin(&fanout).await.unwrap();
        assert_eq!(runner.for_parent(parent).await.unwrap().unwrap().id, fanout.id);
        assert_eq!(runner.list().await.unwrap().len(), 1);
    }
}
