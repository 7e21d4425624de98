//! Durable workflow engine for prior-authorization cases.
//!
//! This crate holds the engine (executor, task gate, event bridge, sub-workflow
//! runner) and the store traits ("ports") that the infrastructure layer
//! implements. It depends only on `authflow-types` -- never on
//! `authflow-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
