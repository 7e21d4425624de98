//! Infrastructure layer for authflow.
//!
//! Implements the store ports defined in `authflow-core` on SQLite and loads
//! engine configuration from the data directory.

pub mod config;
pub mod sqlite;

pub use sqlite::SqliteEngineStore;
pub use sqlite::pool::DatabasePool;
