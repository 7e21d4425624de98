//! Checkpoint manager with a write-back buffer for store outages.
//!
//! Wraps a `CheckpointStore`. A save that fails does not stop the instance:
//! the record is kept in memory, reads go through the buffer, and every later
//! save retries the buffered records first. While anything is buffered the
//! instance is running without crash safety, which callers see as
//! `durable == false`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use authflow_types::error::RepositoryError;
use authflow_types::event::EngineEvent;
use authflow_types::workflow::{Checkpoint, InstanceStatus, WorkflowInstance};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointStore;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// Write-back buffer
// ---------------------------------------------------------------------------

/// Records the store has not taken yet. Entries carry a sequence number so a
/// flush only drops what it actually wrote.
#[derive(Default)]
struct WriteBack {
    seq: u64,
    checkpoints: BTreeMap<(Uuid, u32), (u64, Checkpoint)>,
    instances: HashMap<Uuid, (u64, WorkflowInstance)>,
}

impl WriteBack {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn is_empty(&self) -> bool {
        self.checkpoints.is_empty() && self.instances.is_empty()
    }

    fn len(&self) -> usize {
        self.checkpoints.len() + self.instances.len()
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists checkpoints and instance records, degrading to memory on failure.
pub struct CheckpointManager<S: CheckpointStore> {
    store: Arc<S>,
    events: EventBus,
    pending: Mutex<WriteBack>,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: Arc<S>, events: EventBus) -> Self {
        Self {
            store,
            events,
            pending: Mutex::new(WriteBack::default()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn buffer(&self) -> Result<MutexGuard<'_, WriteBack>, EngineError> {
        self.pending
            .lock()
            .map_err(|_| EngineError::Persistence("write-back buffer poisoned".to_string()))
    }

    /// Whether every record reached the store.
    pub fn is_durable(&self) -> bool {
        self.buffer().map(|b| b.is_empty()).unwrap_or(false)
    }

    /// Whether any record of `instance_id` is still waiting for the store.
    pub fn is_buffered(&self, instance_id: &Uuid) -> bool {
        self.buffer()
            .map(|b| {
                b.instances.contains_key(instance_id)
                    || b.checkpoints.keys().any(|(id, _)| id == instance_id)
            })
            .unwrap_or(true)
    }

    /// Number of buffered records.
    pub fn pending_writes(&self) -> usize {
        self.buffer().map(|b| b.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Save a checkpoint. Returns whether it reached the store.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> bool {
        self.retry_pending().await;

        match self.store.save_checkpoint(checkpoint).await {
            Ok(()) => {
                tracing::debug!(
                    instance_id = %checkpoint.instance_id,
                    step = checkpoint.step_count,
                    pending_node = checkpoint.pending_node.as_deref().unwrap_or("-"),
                    "checkpoint saved"
                );
                true
            }
            Err(RepositoryError::Conflict(reason)) => {
                // a newer checkpoint is stored; this one is stale, not lost
                tracing::debug!(
                    instance_id = %checkpoint.instance_id,
                    step = checkpoint.step_count,
                    reason = reason.as_str(),
                    "stale checkpoint rejected"
                );
                false
            }
            Err(e) => {
                self.degrade(checkpoint.instance_id, &e);
                if let Ok(mut buffer) = self.buffer() {
                    let seq = buffer.next_seq();
                    buffer.checkpoints.insert(
                        (checkpoint.instance_id, checkpoint.step_count),
                        (seq, checkpoint.clone()),
                    );
                }
                false
            }
        }
    }

    /// Save an instance record. Returns whether it reached the store.
    pub async fn save_instance(&self, instance: &WorkflowInstance) -> bool {
        self.retry_pending().await;

        match self.store.save_instance(instance).await {
            Ok(()) => {
                // a buffered older copy must not overwrite this one later
                if let Ok(mut buffer) = self.buffer() {
                    buffer.instances.remove(&instance.id);
                }
                true
            }
            Err(e) => {
                self.degrade(instance.id, &e);
                if let Ok(mut buffer) = self.buffer() {
                    let seq = buffer.next_seq();
                    buffer.instances.insert(instance.id, (seq, instance.clone()));
                }
                false
            }
        }
    }

    fn degrade(&self, instance_id: Uuid, error: &RepositoryError) {
        tracing::warn!(
            instance_id = %instance_id,
            error = %error,
            "store write failed, instance continues without crash safety"
        );
        self.events.publish(EngineEvent::PersistenceDegraded {
            instance_id,
            error: error.to_string(),
        });
    }

    /// Write every buffered record. Returns how many were written.
    ///
    /// Fails with `Persistence` if the store still rejects some of them.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        let flushed = self.retry_pending().await;
        let remaining = self.pending_writes();
        if remaining > 0 {
            return Err(EngineError::Persistence(format!(
                "{remaining} records still buffered"
            )));
        }
        Ok(flushed)
    }

    /// Try to write buffered records in order, stopping at the first outage.
    async fn retry_pending(&self) -> usize {
        let (checkpoints, instances) = match self.buffer() {
            Ok(buffer) if !buffer.is_empty() => (
                buffer
                    .checkpoints
                    .iter()
                    .map(|(key, (seq, cp))| (*key, *seq, cp.clone()))
                    .collect::<Vec<_>>(),
                buffer
                    .instances
                    .iter()
                    .map(|(id, (seq, inst))| (*id, *seq, inst.clone()))
                    .collect::<Vec<_>>(),
            ),
            _ => return 0,
        };

        let mut flushed = 0;
        for (key, seq, checkpoint) in checkpoints {
            match self.store.save_checkpoint(&checkpoint).await {
                Ok(()) => flushed += 1,
                Err(RepositoryError::Conflict(reason)) => {
                    // a newer checkpoint reached the store first
                    tracing::debug!(
                        instance_id = %key.0,
                        step = key.1,
                        reason = reason.as_str(),
                        "dropping stale buffered checkpoint"
                    );
                }
                Err(e) => {
                    tracing::debug!(error = %e, "store still unavailable");
                    return flushed;
                }
            }
            if let Ok(mut buffer) = self.buffer() {
                if buffer.checkpoints.get(&key).is_some_and(|(s, _)| *s == seq) {
                    buffer.checkpoints.remove(&key);
                }
            }
        }

        for (id, seq, instance) in instances {
            if let Err(e) = self.store.save_instance(&instance).await {
                tracing::debug!(error = %e, "store still unavailable");
                return flushed;
            }
            flushed += 1;
            if let Ok(mut buffer) = self.buffer() {
                if buffer.instances.get(&id).is_some_and(|(s, _)| *s == seq) {
                    buffer.instances.remove(&id);
                }
            }
        }

        if self.is_durable() && flushed > 0 {
            tracing::info!(flushed, "buffered records written, persistence restored");
            self.events
                .publish(EngineEvent::PersistenceRestored { flushed });
        }
        flushed
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Latest checkpoint of an instance, buffered or stored.
    pub async fn load_checkpoint(&self, instance_id: &Uuid) -> Result<Option<Checkpoint>, EngineError> {
        let buffered = {
            let buffer = self.buffer()?;
            buffer
                .checkpoints
                .range((*instance_id, 0)..=(*instance_id, u32::MAX))
                .next_back()
                .map(|(_, (_, cp))| cp.clone())
        };

        match self.store.load_checkpoint(instance_id).await {
            Ok(stored) => Ok(match (stored, buffered) {
                (Some(s), Some(b)) if b.step_count >= s.step_count => Some(b),
                (Some(s), _) => Some(s),
                (None, b) => b,
            }),
            Err(e) if buffered.is_some() => {
                tracing::debug!(instance_id = %instance_id, error = %e, "serving checkpoint from buffer");
                Ok(buffered)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current instance record, buffered or stored.
    pub async fn get_instance(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, EngineError> {
        let buffered = self.buffer()?.instances.get(id).map(|(_, i)| i.clone());
        if buffered.is_some() {
            return Ok(buffered);
        }
        Ok(self.store.get_instance(id).await?)
    }

    /// Instances with the given status, buffered records taking precedence.
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        let mut listed = self.store.list_instances(None).await?;
        let buffered: HashMap<Uuid, WorkflowInstance> = self
            .buffer()?
            .instances
            .iter()
            .map(|(id, (_, i))| (*id, i.clone()))
            .collect();

        for instance in listed.iter_mut() {
            if let Some(b) = buffered.get(&instance.id) {
                *instance = b.clone();
            }
        }
        for (id, instance) in buffered {
            if !listed.iter().any(|i| i.id == id) {
                listed.push(instance);
            }
        }
        listed.retain(|i| status.is_none_or(|s| i.status == s));
        listed.sort_by_key(|i| (i.created_at, i.id));
        Ok(listed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
