//! Tracing setup for processes embedding the workflow engine.

pub mod tracing_setup;

pub use tracing_setup::{TracingConfig, init_tracing, shutdown_tracing};
