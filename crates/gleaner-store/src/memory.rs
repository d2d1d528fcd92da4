use std::collections::HashMap;

use gleaner_types::{RunId, RunOptions, RunState, now};
use parking_lot::Mutex;

use crate::store::{CheckpointStore, RunSummary};
use crate::{Result, StoreError};

/// In-memory checkpoint store for tests.
///
/// Same versioning semantics as the SQLite backend.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<RunId, RunState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn create(&self, run_id: RunId, instruction: &str, options: RunOptions) -> Result<RunState> {
        let mut runs = self.runs.lock();
        if runs.contains_key(&run_id) {
            return Err(StoreError::AlreadyExists(run_id));
        }
        let state = RunState::new(run_id.clone(), instruction, options);
        runs.insert(run_id, state.clone());
        Ok(state)
    }

    fn load(&self, run_id: &RunId) -> Result<Option<RunState>> {
        Ok(self.runs.lock().get(run_id).cloned())
    }

    fn save(&self, state: &mut RunState) -> Result<()> {
        let mut runs = self.runs.lock();
        let stored = runs
            .get_mut(&state.run_id)
            .ok_or_else(|| StoreError::NotFound(state.run_id.clone()))?;

        if stored.version != state.version {
            return Err(StoreError::Conflict {
                run_id: state.run_id.clone(),
                expected: state.version,
                found: stored.version,
            });
        }

        state.version += 1;
        state.updated_at = now();
        *stored = state.clone();
        Ok(())
    }

    fn delete(&self, run_id: &RunId) -> Result<bool> {
        Ok(self.runs.lock().remove(run_id).is_some())
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut rows: Vec<RunSummary> = self
            .runs
            .lock()
            .values()
            .map(RunSummary::from_state)
            .collect();
        rows.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        rows.truncate(limit);
        Ok(rows)
    }

    fn list_pending(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = self
            .runs
            .lock()
            .values()
            .filter(|s| s.lease.is_some() && !s.is_terminal())
            .map(|s| s.run_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
