//! Per-source stage progress.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single stage within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not started yet.
    #[default]
    Pending,
    /// Collection in progress (possibly across invocations).
    Active,
    /// Target reached.
    Done,
    /// Source exhausted below target after all expansions; accepted.
    Shortfall,
    /// Source was not usable for this run.
    Skipped,
    /// Collection errored after retries; later stages still run.
    Failed,
}

impl StageState {
    /// Whether the stage has stopped for this run's normal flow.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Shortfall | Self::Skipped | Self::Failed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Shortfall => "shortfall",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Checkpointed progress for one source.
///
/// `collected` never decreases and `processed_ids` never shrinks; an id in
/// `processed_ids` has already been handed to the output sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub collected: u32,
    pub target: u32,
    /// Resumption cursor returned by the collector.
    pub cursor: Option<String>,
    /// Within-run dedup ledger.
    #[serde(default)]
    pub processed_ids: BTreeSet<String>,
    #[serde(default)]
    pub state: StageState,
    /// Number of query expansions already applied.
    #[serde(default)]
    pub expansions: u32,
    /// Items dropped because their id had already been processed.
    #[serde(default)]
    pub duplicates_dropped: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
}

impl StageProgress {
    /// Fresh progress for a stage with the given target.
    pub fn new(target: u32) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    /// Whether the target has been reached.
    pub fn target_reached(&self) -> bool {
        self.collected >= self.target
    }

    /// Items still needed to reach the target.
    pub fn remaining(&self) -> u32 {
        self.target.saturating_sub(self.collected)
    }

    /// Whether an item id has already been emitted.
    pub fn has_processed(&self, id: &str) -> bool {
        self.processed_ids.contains(id)
    }

    /// Record a newly emitted item. Returns false (and records nothing
    /// beyond the duplicate counter) if the id was already processed.
    pub fn record(&mut self, id: &str) -> bool {
        if self.processed_ids.insert(id.to_string()) {
            self.collected += 1;
            true
        } else {
            self.duplicates_dropped += 1;
            false
        }
    }
}
