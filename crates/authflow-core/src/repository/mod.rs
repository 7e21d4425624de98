//! Store trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (authflow-infra) implements. The core crate never depends on any specific
//! storage technology; `memory::InMemoryStore` serves embedding and tests.

pub mod checkpoint;
pub mod fanout;
pub mod memory;
pub mod task;
pub mod watch;

pub use checkpoint::CheckpointStore;
pub use fanout::FanoutStore;
pub use memory::InMemoryStore;
pub use task::TaskStore;
pub use watch::WatchStore;

/// Everything the engine persists. Implemented for any type that provides all
/// four stores.
pub trait EngineStore: CheckpointStore + TaskStore + WatchStore + FanoutStore + 'static {}

impl<T> EngineStore for T where T: CheckpointStore + TaskStore + WatchStore + FanoutStore + 'static {}
