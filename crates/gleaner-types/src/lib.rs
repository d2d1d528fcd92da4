//! Shared types for the Gleaner collection workflow.
//!
//! `RunState` is the single source of truth for a run: every other component
//! either reads it or hands the orchestrator a delta to fold into it.

pub mod availability;
pub mod error;
pub mod item;
pub mod plan;
pub mod run;
pub mod stage;
pub mod status;

pub use availability::{Availability, SourceAvailability};
pub use error::{Result, TypesError};
pub use item::{OutputRow, RawItem};
pub use plan::{Plan, PlanOrigin};
pub use run::{Completion, ContinuationLease, Resources, RunId, RunOptions, RunState, RunStatus, Shortfall};
pub use stage::{StageProgress, StageState};
pub use status::{RunStatusView, SourceProgressView};

/// Timestamp type used throughout.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Current time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
