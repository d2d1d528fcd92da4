//! Checkpoint store abstraction.

use gleaner_types::{RunId, RunOptions, RunState, RunStatus, Timestamp};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::retention::{PruneReport, select_prunable};

/// Lightweight listing row (no progress ledgers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    /// A continuation lease is recorded.
    pub pending: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RunSummary {
    pub fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status.clone(),
            pending: state.lease.is_some(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Durable persistence for one `RunState` per run.
///
/// Every operation is atomic from the caller's point of view: a reader never
/// observes a partially written state.
pub trait CheckpointStore: Send + Sync {
    /// Create and persist a new run in `CREATED`.
    fn create(&self, run_id: RunId, instruction: &str, options: RunOptions) -> Result<RunState>;

    /// Load a run, `None` if it does not exist.
    fn load(&self, run_id: &RunId) -> Result<Option<RunState>>;

    /// Overwrite the stored state.
    ///
    /// Succeeds only if the stored version equals `state.version`; on success
    /// the version is bumped and `updated_at` refreshed in `state`.
    fn save(&self, state: &mut RunState) -> Result<()>;

    /// Delete a run. Returns whether anything was deleted.
    fn delete(&self, run_id: &RunId) -> Result<bool>;

    /// Most recent runs first, ordered by run id.
    fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>>;

    /// Non-terminal runs holding a continuation lease, oldest first.
    fn list_pending(&self) -> Result<Vec<RunId>>;

    /// Keep the `keep` most recent runs and delete older terminal ones.
    ///
    /// Best-effort housekeeping: runs that are not terminal are never
    /// touched, and a run that disappears mid-sweep is not an error.
    fn prune(&self, keep: usize) -> Result<PruneReport> {
        let runs = self.list_recent(usize::MAX)?;
        let mut report = select_prunable(&runs, keep);
        let mut deleted = Vec::with_capacity(report.deleted.len());
        for run_id in report.deleted.drain(..) {
            if self.delete(&run_id)? {
                deleted.push(run_id);
            }
        }
        report.deleted = deleted;
        Ok(report)
    }
}
