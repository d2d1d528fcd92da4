//! Checkpoint store for Gleaner runs.
//!
//! One `RunState` per run id, written whole on every save. Saves are
//! versioned: a save built from a stale load fails with
//! [`StoreError::Conflict`] instead of silently clobbering newer progress.
//!
//! # Backends
//!
//! ```text
//! CheckpointStore (trait)
//!     └── SqliteCheckpointStore   - Durable SQLite implementation
//!     └── MemoryCheckpointStore   - In-memory implementation for tests
//! ```

pub mod error;
pub mod memory;
pub mod retention;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryCheckpointStore;
pub use retention::{PruneReport, select_prunable};
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointStore, RunSummary};
