//! Retention policy for old runs.

use gleaner_types::RunId;
use serde::{Deserialize, Serialize};

use crate::store::RunSummary;

/// Outcome of a retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Runs examined.
    pub examined: usize,
    /// Runs deleted.
    pub deleted: Vec<RunId>,
    /// Runs past the retention window that were kept because they are still active.
    pub kept_active: usize,
}

/// Decide which runs a sweep should delete.
///
/// `runs` may be in any order; the `keep` runs with the greatest ids survive.
/// Of the rest only terminal runs are selected.
pub fn select_prunable(runs: &[RunSummary], keep: usize) -> PruneReport {
    let mut ordered: Vec<&RunSummary> = runs.iter().collect();
    ordered.sort_by(|a, b| b.run_id.cmp(&a.run_id));

    let mut report = PruneReport {
        examined: ordered.len(),
        ..Default::default()
    };
    for run in ordered.into_iter().skip(keep) {
        if run.status.is_terminal() {
            report.deleted.push(run.run_id.clone());
        } else {
            report.kept_active += 1;
        }
    }
    report
}
