//! Run identity, lifecycle state machine and the checkpointed `RunState`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::availability::SourceAvailability;
use crate::error::{Result, TypesError};
use crate::plan::Plan;
use crate::stage::{StageProgress, StageState};
use crate::status::{RunStatusView, SourceProgressView};
use crate::{Timestamp, now};

// ─────────────────────────────────────────────────────────────────────────────
// Run Id
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque run identifier.
///
/// Backed by a UUIDv7, so the lexical order of ids is their creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Allocate a new time-ordered run id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Parse a run id supplied by a caller.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s.trim()).map_err(|_| TypesError::InvalidRunId(s.to_string()))?;
        Ok(Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status State Machine
// ─────────────────────────────────────────────────────────────────────────────

/// Run lifecycle status.
///
/// ```text
/// CREATED → PLANNING → COLLECTING(s₁) → … → COLLECTING(sₙ) → FINALIZING → COMPLETED
///    any non-terminal ──────────────────────────────────────────────────→ FAILED
///    FAILED → COLLECTING(sₖ) | FINALIZING   (explicit recovery only)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "source", rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Planning,
    Collecting(String),
    Finalizing,
    Completed,
    Failed,
}

impl RunStatus {
    /// Terminal for normal flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stable label without the stage name (stored in an indexed column).
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Collecting(_) => "collecting",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Collecting(source) => write!(f, "collecting({source})"),
            other => f.write_str(other.label()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supporting Records
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-supplied options for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Caller's own identifier for the run.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    /// Use an existing output sink instead of creating one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_sink: Option<String>,
    /// Target counts that override the planner's.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub target_overrides: BTreeMap<String, u32>,
}

/// Identifiers of externally created artifacts. Set once, never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_sink: Option<String>,
    /// Where a human can find the output (path or URL).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub root_container: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub source_containers: BTreeMap<String, String>,
}

impl Resources {
    /// Set the output sink unless one is already recorded.
    pub fn set_output_sink(&mut self, id: impl Into<String>, location: impl Into<String>) -> bool {
        if self.output_sink.is_some() {
            return false;
        }
        self.output_sink = Some(id.into());
        self.output_location = Some(location.into());
        true
    }

    /// Set the root artifact container unless one is already recorded.
    pub fn set_root_container(&mut self, id: impl Into<String>) -> bool {
        if self.root_container.is_some() {
            return false;
        }
        self.root_container = Some(id.into());
        true
    }

    /// Set a per-source container unless one is already recorded.
    pub fn set_source_container(&mut self, source: &str, id: impl Into<String>) -> bool {
        if self.source_containers.contains_key(source) {
            return false;
        }
        self.source_containers.insert(source.to_string(), id.into());
        true
    }
}

/// Per-run marker for the one armed continuation callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationLease {
    /// Token the callback must present; anything else is stale.
    pub token: String,
    /// Host timer backing this lease.
    pub timer_id: String,
    pub armed_at: Timestamp,
}

impl ContinuationLease {
    pub fn new(timer_id: impl Into<String>) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            timer_id: timer_id.into(),
            armed_at: now(),
        }
    }
}

/// A stage that finished below target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub source: String,
    pub collected: u32,
    pub target: u32,
}

/// Summary written when a run completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub total_collected: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub shortfalls: Vec<Shortfall>,
    /// Set when nothing was collected at all.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub warning: Option<String>,
    /// Source configuration at completion time, attached to empty runs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub availability: Option<SourceAvailability>,
    pub completed_at: Timestamp,
}

impl Completion {
    /// Whether this run completed without collecting anything.
    pub fn is_empty_result(&self) -> bool {
        self.total_collected == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run State
// ─────────────────────────────────────────────────────────────────────────────

/// The checkpointed state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub instruction: String,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plan: Option<Plan>,
    /// Stage order for this run (source names).
    #[serde(default)]
    pub stage_order: Vec<String>,
    #[serde(default)]
    pub stage_progress: BTreeMap<String, StageProgress>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub availability: SourceAvailability,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lease: Option<ContinuationLease>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completion: Option<Completion>,
    /// Incremented by every successful save.
    #[serde(default)]
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RunState {
    /// Create a new run in `CREATED`.
    pub fn new(run_id: RunId, instruction: impl Into<String>, options: RunOptions) -> Self {
        let ts = now();
        Self {
            run_id,
            status: RunStatus::Created,
            instruction: instruction.into(),
            options,
            plan: None,
            stage_order: Vec::new(),
            stage_progress: BTreeMap::new(),
            resources: Resources::default(),
            availability: SourceAvailability::new(),
            lease: None,
            last_error: None,
            last_message: None,
            completion: None,
            version: 0,
            created_at: ts,
            updated_at: ts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn stage_index(&self, source: &str) -> Option<usize> {
        self.stage_order.iter().position(|s| s == source)
    }

    /// Move to `next`, rejecting anything that is not an edge of the state
    /// machine. Collecting stages may only advance in stage order.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        use RunStatus::*;

        let allowed = match (&self.status, &next) {
            (Created, Planning) => true,
            (Planning, Collecting(s)) => self.stage_index(s).is_some(),
            (Planning, Finalizing) => true,
            (Collecting(a), Collecting(b)) => match (self.stage_index(a), self.stage_index(b)) {
                (Some(i), Some(j)) => j > i,
                _ => false,
            },
            (Collecting(_), Finalizing) => true,
            (Finalizing, Completed) => true,
            (Failed, Collecting(s)) => self.stage_index(s).is_some(),
            (Failed, Finalizing) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        };

        if !allowed {
            return Err(TypesError::InvalidTransition {
                run_id: self.run_id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark the run failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.transition(RunStatus::Failed)?;
        self.last_message = Some(format!("Run failed: {error}"));
        self.last_error = Some(error);
        Ok(())
    }

    /// Set the latest human-readable status line.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.last_message = Some(message.into());
    }

    /// Store the plan and create progress entries for every stage in `order`.
    ///
    /// Existing progress is kept, so re-running this after an interrupted
    /// planning step never resets counters.
    pub fn apply_plan(&mut self, plan: Plan, order: Vec<String>) {
        for source in &order {
            let target = plan.target_for(source);
            self.stage_progress
                .entry(source.clone())
                .or_insert_with(|| StageProgress::new(target));
        }
        self.stage_order = order;
        self.plan = Some(plan);
    }

    pub fn progress(&self, source: &str) -> Option<&StageProgress> {
        self.stage_progress.get(source)
    }

    pub fn progress_mut(&mut self, source: &str) -> Result<&mut StageProgress> {
        self.stage_progress
            .get_mut(source)
            .ok_or_else(|| TypesError::UnknownStage(source.to_string()))
    }

    /// Total items collected across all stages.
    pub fn total_collected(&self) -> u64 {
        self.stage_progress.values().map(|p| u64::from(p.collected)).sum()
    }

    /// First stage in order that has not settled, else `FINALIZING`.
    pub fn first_open_stage(&self) -> RunStatus {
        self.stage_order
            .iter()
            .find(|s| self.progress(s).is_some_and(|p| !p.state.is_settled()))
            .map(|s| RunStatus::Collecting(s.clone()))
            .unwrap_or(RunStatus::Finalizing)
    }

    /// Next unsettled stage after `current`, else `FINALIZING`.
    pub fn next_stage_after(&self, current: &str) -> RunStatus {
        let start = self.stage_index(current).map(|i| i + 1).unwrap_or(0);
        self.stage_order[start.min(self.stage_order.len())..]
            .iter()
            .find(|s| self.progress(s).is_some_and(|p| !p.state.is_settled()))
            .map(|s| RunStatus::Collecting(s.clone()))
            .unwrap_or(RunStatus::Finalizing)
    }

    /// Where a recovered run resumes: the first usable stage still under
    /// target (shortfalls already accepted are not revisited), else
    /// `FINALIZING`.
    pub fn resume_stage(&self) -> RunStatus {
        self.stage_order
            .iter()
            .find(|s| {
                self.availability.is_usable(s)
                    && self.progress(s).is_some_and(|p| {
                        !p.target_reached() && p.state != StageState::Shortfall
                    })
            })
            .map(|s| RunStatus::Collecting(s.clone()))
            .unwrap_or(RunStatus::Finalizing)
    }

    /// Reopen stages that failed or were skipped but are now usable and
    /// under target. Used before recovery.
    pub fn reopen_stages(&mut self) {
        let availability = self.availability.clone();
        for (source, progress) in self.stage_progress.iter_mut() {
            let reopen = matches!(progress.state, StageState::Failed | StageState::Skipped)
                && availability.is_usable(source)
                && !progress.target_reached();
            if reopen {
                progress.state = StageState::Pending;
                progress.last_error = None;
            }
        }
    }

    /// Read-only projection for status polling.
    pub fn status_view(&self) -> RunStatusView {
        let per_source = self
            .stage_order
            .iter()
            .filter_map(|source| {
                self.progress(source).map(|p| SourceProgressView {
                    source: source.clone(),
                    collected: p.collected,
                    target: p.target,
                    state: p.state,
                    expansions: p.expansions,
                    duplicates_dropped: p.duplicates_dropped,
                    last_error: p.last_error.clone(),
                })
            })
            .collect();

        let empty_result = matches!(self.status, RunStatus::Completed)
            && self.completion.as_ref().is_some_and(Completion::is_empty_result);

        RunStatusView {
            run_id: self.run_id.clone(),
            status: self.status.clone(),
            per_source,
            total_collected: self.total_collected(),
            last_message: self.last_message.clone(),
            last_error: self.last_error.clone(),
            output_location: self.resources.output_location.clone(),
            empty_result,
            warning: self.completion.as_ref().and_then(|c| c.warning.clone()),
            continuation_pending: self.lease.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
