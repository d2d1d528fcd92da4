//! Read-only run projections for polling clients.

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::run::{RunId, RunStatus};
use crate::stage::StageState;

/// Progress of one source as shown to a poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgressView {
    pub source: String,
    pub collected: u32,
    pub target: u32,
    pub state: StageState,
    pub expansions: u32,
    pub duplicates_dropped: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
}

/// Answer to `getRunStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub per_source: Vec<SourceProgressView>,
    pub total_collected: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_location: Option<String>,
    /// Completed, but nothing was collected from any source.
    pub empty_result: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub warning: Option<String>,
    /// A continuation callback is armed for this run.
    pub continuation_pending: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
