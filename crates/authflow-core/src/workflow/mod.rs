//! Workflow engine core: definitions, execution, and durable suspension.
//!
//! - `definition` -- node graph, routing edges and build-time validation
//! - `registry` -- registered definitions by id and version
//! - `executor` -- checkpointed step loop, suspensions, launch/recover/cancel
//! - `checkpoint` -- checkpoint writes with an outage write-back buffer
//! - `task_gate` -- human task lifecycle, one open task per instance
//! - `event_bridge` -- status watches polled with exponential backoff
//! - `subworkflow` -- fan-out records and exactly-once fan-in
//! - `decision` -- confidence-gated routing of reasoning output
//! - `reasoning` -- schema-checked, retried, time-bounded reasoning calls
//! - `tool` -- audited, retried tool calls with idempotency keys

pub mod checkpoint;
pub mod decision;
pub mod definition;
pub mod error;
pub mod event_bridge;
pub mod executor;
pub mod node;
pub mod reasoning;
pub mod registry;
pub mod retry;
pub mod routing;
pub mod subworkflow;
pub mod task_gate;
pub mod tool;

#[cfg(test)]
pub(crate) mod testkit;

pub use definition::{
    ChildResult, DefinitionBuilder, PartialFailurePolicy, SubworkflowSpec, WorkflowDefinition,
};
pub use error::EngineError;
pub use event_bridge::{AsyncEventBridge, PollOutcome, PollReport, StatusClassifier};
pub use executor::{
    BlockerDetail, EngineServices, InstanceReport, LaunchReport, RecoveryReport, WorkflowEngine,
};
pub use node::{NodeContext, NodeHandler, Transition, handler_fn};
