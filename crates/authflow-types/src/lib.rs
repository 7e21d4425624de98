//! Shared domain types for Authflow.
//!
//! This crate contains the data model of the workflow engine: instances and
//! checkpoints, human tasks, status watches, fan-out records, reasoning output,
//! stage payloads, engine configuration and events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod event;
pub mod fanout;
pub mod payload;
pub mod task;
pub mod watch;
pub mod workflow;
