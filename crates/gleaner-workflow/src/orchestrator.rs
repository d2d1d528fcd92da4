//! The workflow orchestrator.
//!
//! Owns the run lifecycle: starting runs, driving them through their stages
//! one budgeted invocation at a time, and suspending them behind a
//! continuation lease when the budget runs out.
//!
//! ```text
//! start_run ──► CREATED ─► PLANNING ─► schedule ─┐
//!                                                 ▼
//!        timer ──► continue_run(run_id, token) ──► COLLECTING(s₁) … COLLECTING(sₙ)
//!                      ▲                              │ budget exhausted
//!                      └──────── schedule ◄───────────┘
//!                                                 ▼
//!                                         FINALIZING ─► COMPLETED
//! ```
//!
//! Every mutation is load → mutate → save against a versioned checkpoint. An
//! invocation whose save loses the compare-and-swap abandons its work and
//! reports [`Invocation::Superseded`]; it never records a failure.

use std::sync::Arc;
use std::time::Duration;

use gleaner_config::GleanerConfig;
use gleaner_store::{CheckpointStore, PruneReport, RunSummary};
use gleaner_types::{
    Completion, RunId, RunOptions, RunState, RunStatus, RunStatusView, Shortfall,
    SourceAvailability, StageState, now,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactStore;
use crate::budget::Budget;
use crate::collector::CollectorRegistry;
use crate::error::{Result, StageFailure, WorkflowError};
use crate::planner::{HeuristicPlanner, Planner};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::scheduler::{ContinuationScheduler, TimerHost};
use crate::sink::OutputSink;
use crate::stage::{StageOutcome, StageRunner};

/// Attempts `cancel_run` makes when it keeps losing the save race.
const CANCEL_ATTEMPTS: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Settings & Results
// ─────────────────────────────────────────────────────────────────────────────

/// Orchestrator tuning, normally taken from `[workflow]` and `[retention]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Wall-clock budget of one invocation (host limit minus safety margin).
    pub budget: Duration,
    pub batch_size: usize,
    pub max_expansions: u32,
    pub continuation_delay: Duration,
    /// Runs kept by the sweep that follows each completion.
    pub keep_runs: usize,
}

impl WorkflowSettings {
    pub fn from_config(config: &GleanerConfig) -> Self {
        let workflow = config.workflow();
        Self {
            budget: workflow.budget(),
            batch_size: workflow.batch_size.max(1),
            max_expansions: workflow.max_expansions,
            continuation_delay: workflow.continuation_delay(),
            keep_runs: config.retention().keep_runs,
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&GleanerConfig::default())
    }
}

/// What `start_run` hands back before any collection happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRun {
    pub run_id: RunId,
    pub status: RunStatus,
    pub output_location: Option<String>,
    /// Set when the run failed while being set up.
    pub last_error: Option<String>,
}

/// Result of one continuation invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The run does not exist.
    NoRun,
    /// The callback's token does not match the run's lease.
    Stale,
    /// The run was already terminal; any leftover lease was cleared.
    AlreadyTerminal(RunStatus),
    /// Another invocation saved first; this one backed off.
    Superseded,
    /// Budget ran out; a continuation is armed.
    Suspended { stage: String },
    /// The run reached a terminal status during this invocation.
    Finished(RunStatus),
}

impl Invocation {
    /// Whether the run still has work scheduled after this invocation.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    store: Option<Arc<dyn CheckpointStore>>,
    collectors: CollectorRegistry,
    planner: Option<Arc<dyn Planner>>,
    sink: Option<Arc<dyn OutputSink>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    timer_host: Option<Arc<dyn TimerHost>>,
    retry: Option<RetryExecutor>,
    settings: WorkflowSettings,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take settings and retry policy from configuration.
    pub fn config(mut self, config: &GleanerConfig) -> Self {
        self.settings = WorkflowSettings::from_config(config);
        self.retry = Some(RetryExecutor::new(RetryPolicy::from(config.retry())));
        self
    }

    pub fn settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn collectors(mut self, collectors: CollectorRegistry) -> Self {
        self.collectors = collectors;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn timer_host(mut self, host: Arc<dyn TimerHost>) -> Self {
        self.timer_host = Some(host);
        self
    }

    pub fn retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let missing = |what: &str| WorkflowError::Config(format!("orchestrator needs {what}"));
        let timer_host = self.timer_host.ok_or_else(|| missing("a timer host"))?;
        Ok(Orchestrator {
            store: self.store.ok_or_else(|| missing("a checkpoint store"))?,
            sink: self.sink.ok_or_else(|| missing("an output sink"))?,
            artifacts: self.artifacts.ok_or_else(|| missing("an artifact store"))?,
            planner: self
                .planner
                .unwrap_or_else(|| Arc::new(HeuristicPlanner::new())),
            scheduler: ContinuationScheduler::new(timer_host, self.settings.continuation_delay),
            retry: self
                .retry
                .unwrap_or_else(|| RetryExecutor::new(RetryPolicy::default())),
            collectors: self.collectors,
            settings: self.settings,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Drives runs through their lifecycle.
pub struct Orchestrator {
    store: Arc<dyn CheckpointStore>,
    collectors: CollectorRegistry,
    planner: Arc<dyn Planner>,
    sink: Arc<dyn OutputSink>,
    artifacts: Arc<dyn ArtifactStore>,
    scheduler: ContinuationScheduler,
    retry: RetryExecutor,
    settings: WorkflowSettings,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn scheduler(&self) -> &ContinuationScheduler {
        &self.scheduler
    }

    pub fn collectors(&self) -> &CollectorRegistry {
        &self.collectors
    }

    /// Ask every registered collector whether it is usable right now.
    pub fn source_availability(&self) -> SourceAvailability {
        self.collectors.snapshot()
    }

    // ── Control surface ─────────────────────────────────────────────────

    /// Start a run: check sources, plan, create output resources and arm the
    /// first continuation. Returns without collecting anything.
    ///
    /// Fails before any state exists when no source is usable.
    pub async fn start_run(&self, instruction: &str, options: RunOptions) -> Result<StartedRun> {
        let availability = self.collectors.snapshot();
        ensure_usable(&availability)?;

        let run_id = RunId::generate();
        let mut state = self.store.create(run_id.clone(), instruction, options)?;
        info!(run_id = %run_id, sources = availability.len(), "Run created");

        state.availability = availability;
        state.transition(RunStatus::Planning)?;
        state.set_message("Planning");
        self.store.save(&mut state)?;

        if let Err(e) = self.launch(&mut state).await {
            if e.is_conflict() {
                return Err(e);
            }
            self.fail_run(&mut state, &e.to_string())?;
        }

        Ok(StartedRun {
            run_id,
            status: state.status.clone(),
            output_location: state.resources.output_location.clone(),
            last_error: state.last_error.clone(),
        })
    }

    /// One invocation of the continuation entry point.
    ///
    /// `token` is the lease token the timer carried. `None` means the caller
    /// is a scan or an operator, and the lease is not checked.
    pub async fn continue_run(&self, run_id: &RunId, token: Option<&str>) -> Result<Invocation> {
        let Some(mut state) = self.store.load(run_id)? else {
            debug!(run_id = %run_id, "Continuation for unknown run");
            self.scheduler.cancel(run_id);
            return Ok(Invocation::NoRun);
        };

        // A terminal run never keeps a lease, whoever's callback this is.
        if state.is_terminal() {
            if state.lease.take().is_some() {
                self.scheduler.cancel(run_id);
                match self.store.save(&mut state) {
                    Ok(()) => debug!(run_id = %run_id, "Cleared lease of terminal run"),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(Invocation::AlreadyTerminal(state.status.clone()));
        }

        if let Some(token) = token
            && state.lease.as_ref().map(|l| l.token.as_str()) != Some(token)
        {
            debug!(run_id = %run_id, "Ignoring stale continuation");
            return Ok(Invocation::Stale);
        }

        // Claim the run. Whoever saves first owns this invocation.
        state.lease = None;
        self.scheduler.cancel(run_id);
        match self.store.save(&mut state) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Ok(Invocation::Superseded),
            Err(e) => return Err(e.into()),
        }

        let budget = Budget::start(self.settings.budget);
        info!(
            run_id = %run_id,
            status = %state.status,
            budget_ms = budget.limit().as_millis() as u64,
            "Continuing run"
        );

        match self.drive(&mut state, &budget).await {
            Ok(invocation) => Ok(invocation),
            Err(e) if e.is_conflict() => {
                warn!(run_id = %run_id, error = %e, "Checkpoint changed under this invocation, backing off");
                Ok(Invocation::Superseded)
            }
            Err(e) => {
                self.fail_run(&mut state, &e.to_string())?;
                Ok(Invocation::Finished(RunStatus::Failed))
            }
        }
    }

    /// Continue every run that holds a continuation lease, oldest first.
    ///
    /// A no-op when nothing is pending.
    pub async fn continue_pending(&self) -> Result<Vec<(RunId, Invocation)>> {
        let pending = self.store.list_pending()?;
        if pending.is_empty() {
            debug!("No pending runs");
        }
        let mut results = Vec::with_capacity(pending.len());
        for run_id in pending {
            let invocation = self.continue_run(&run_id, None).await?;
            results.push((run_id, invocation));
        }
        Ok(results)
    }

    /// Cancel a non-terminal run.
    ///
    /// Cooperative: an invocation already in flight may still append rows it
    /// has fetched, but its next checkpoint loses the race and it backs off.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<RunStatusView> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut state = self.load_existing(run_id)?;
            if state.is_terminal() {
                return Err(WorkflowError::InvalidState {
                    run_id: run_id.clone(),
                    status: state.status,
                    operation: "cancel",
                });
            }

            self.scheduler.cancel(run_id);
            state.lease = None;
            state.fail("cancelled")?;
            state.set_message("Run cancelled");
            match self.store.save(&mut state) {
                Ok(()) => {
                    info!(run_id = %run_id, "Run cancelled");
                    return Ok(state.status_view());
                }
                Err(e) if e.is_conflict() && attempt < CANCEL_ATTEMPTS => {
                    debug!(run_id = %run_id, attempt, "Cancel lost a save race, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Resume a failed run at its first usable, under-target stage.
    pub async fn retry_run(&self, run_id: &RunId) -> Result<RunStatusView> {
        let mut state = self.load_existing(run_id)?;
        if state.status != RunStatus::Failed {
            return Err(WorkflowError::InvalidState {
                run_id: run_id.clone(),
                status: state.status,
                operation: "retry",
            });
        }

        let availability = self.collectors.snapshot();
        ensure_usable(&availability)?;
        state.availability = availability;

        self.prepare(&mut state).await?;
        state.reopen_stages();
        let resume = state.resume_stage();
        state.transition(resume.clone())?;
        state.last_error = None;
        state.completion = None;
        state.lease = Some(self.scheduler.schedule(run_id)?);
        state.set_message(format!("Retrying from {resume}"));
        self.store.save(&mut state)?;

        info!(run_id = %run_id, resume = %resume, "Run retried");
        Ok(state.status_view())
    }

    /// Read-only projection of a run for polling clients.
    pub fn get_run_status(&self, run_id: &RunId) -> Result<RunStatusView> {
        Ok(self.load_existing(run_id)?.status_view())
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        Ok(self.store.list_recent(limit)?)
    }

    /// Retention sweep. Never touches runs that are not terminal.
    pub fn prune(&self, keep: usize) -> Result<PruneReport> {
        let report = self.store.prune(keep)?;
        info!(
            examined = report.examined,
            deleted = report.deleted.len(),
            kept_active = report.kept_active,
            "Pruned runs"
        );
        Ok(report)
    }

    // ── Lifecycle internals ─────────────────────────────────────────────

    fn load_existing(&self, run_id: &RunId) -> Result<RunState> {
        self.store
            .load(run_id)?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.clone()))
    }

    /// Plan, create resources, enter the first stage and arm the lease.
    async fn launch(&self, state: &mut RunState) -> Result<()> {
        self.prepare(state).await?;
        let first = state.first_open_stage();
        state.transition(first.clone())?;
        state.lease = Some(self.scheduler.schedule(&state.run_id)?);
        state.set_message(format!(
            "Planned {} stage(s); starting with {first}",
            state.stage_order.len()
        ));
        self.store.save(state)?;
        info!(run_id = %state.run_id, first = %first, "Run scheduled");
        Ok(())
    }

    /// Plan once and create external resources once. Safe to repeat: each
    /// step is skipped when its result is already checkpointed.
    async fn prepare(&self, state: &mut RunState) -> Result<()> {
        if state.plan.is_none() {
            let sources = self.collectors.source_infos();
            let mut plan = self.planner.plan(&state.instruction, &sources).await?;
            for info in &sources {
                plan.target_counts
                    .entry(info.name.clone())
                    .or_insert(info.default_target);
            }
            for (source, target) in &state.options.target_overrides {
                plan.target_counts.insert(source.clone(), *target);
            }
            info!(
                run_id = %state.run_id,
                origin = ?plan.origin,
                terms = plan.search_terms.len(),
                "Plan ready"
            );
            state.apply_plan(plan, self.collectors.names());
            self.store.save(state)?;
        }

        if state.resources.output_sink.is_none() {
            let (id, location) = match state.options.output_sink.clone() {
                Some(id) => {
                    let location = self.sink.location(&id);
                    (id, location)
                }
                None => {
                    let handle = self.sink.create_sink(&state.run_id).await?;
                    (handle.id, handle.location)
                }
            };
            state.resources.set_output_sink(id, location);
            self.store.save(state)?;
        }

        if state.resources.root_container.is_none() {
            let id = self.artifacts.create_container(&state.run_id, None).await?;
            state.resources.set_root_container(id);
            self.store.save(state)?;
        }

        let missing: Vec<String> = state
            .stage_order
            .iter()
            .filter(|s| state.availability.is_usable(s))
            .filter(|s| !state.resources.source_containers.contains_key(*s))
            .cloned()
            .collect();
        for source in missing {
            let id = self
                .artifacts
                .create_container(&state.run_id, Some(&source))
                .await?;
            state.resources.set_source_container(&source, id);
            self.store.save(state)?;
        }
        Ok(())
    }

    /// Dispatch on status until the run suspends or ends.
    async fn drive(&self, state: &mut RunState, budget: &Budget) -> Result<Invocation> {
        loop {
            match state.status.clone() {
                RunStatus::Created => {
                    state.transition(RunStatus::Planning)?;
                    self.store.save(state)?;
                }
                RunStatus::Planning => {
                    self.prepare(state).await?;
                    let first = state.first_open_stage();
                    state.transition(first)?;
                    self.store.save(state)?;
                }
                RunStatus::Collecting(source) => {
                    let outcome = self
                        .stage_runner()
                        .run(state, &source, self.collectors.get(&source), budget)
                        .await;
                    match outcome {
                        Ok(StageOutcome::BudgetExhausted) => return self.suspend(state, &source),
                        Ok(_) => {}
                        Err(StageFailure::Source { source_name, error }) => {
                            warn!(
                                run_id = %state.run_id,
                                source = %source_name,
                                error = %error,
                                "Stage failed, moving to next stage"
                            );
                        }
                        Err(StageFailure::Run(e)) => return Err(e),
                    }

                    let next = state.next_stage_after(&source);
                    state.transition(next.clone())?;
                    state.set_message(format!(
                        "{source} {}; {} item(s) so far",
                        state
                            .progress(&source)
                            .map_or(StageState::Pending, |p| p.state),
                        state.total_collected()
                    ));
                    self.store.save(state)?;

                    if let RunStatus::Collecting(next_source) = &next
                        && budget.is_exhausted()
                    {
                        return self.suspend(state, next_source);
                    }
                }
                RunStatus::Finalizing => {
                    self.finalize(state).await?;
                    return Ok(Invocation::Finished(state.status.clone()));
                }
                RunStatus::Completed | RunStatus::Failed => {
                    return Ok(Invocation::Finished(state.status.clone()));
                }
            }
        }
    }

    fn stage_runner(&self) -> StageRunner<'_> {
        StageRunner {
            store: self.store.as_ref(),
            sink: self.sink.as_ref(),
            artifacts: self.artifacts.as_ref(),
            retry: &self.retry,
            batch_size: self.settings.batch_size,
            max_expansions: self.settings.max_expansions,
        }
    }

    /// Checkpoint and arm the next continuation.
    fn suspend(&self, state: &mut RunState, stage: &str) -> Result<Invocation> {
        state.lease = Some(self.scheduler.schedule(&state.run_id)?);
        state.set_message(format!(
            "Budget exhausted during {stage}; {} item(s) so far, continuation scheduled",
            state.total_collected()
        ));
        self.store.save(state)?;
        info!(run_id = %state.run_id, stage, "Run suspended");
        Ok(Invocation::Suspended {
            stage: stage.to_string(),
        })
    }

    /// Close the sink, write the manifest and complete the run.
    async fn finalize(&self, state: &mut RunState) -> Result<()> {
        let total = state.total_collected();

        let failures: Vec<String> = state
            .stage_order
            .iter()
            .filter_map(|s| {
                let p = state.progress(s)?;
                (p.state == StageState::Failed).then(|| {
                    format!("{s}: {}", p.last_error.as_deref().unwrap_or("unknown error"))
                })
            })
            .collect();
        let any_settled_ok = state
            .stage_progress
            .values()
            .any(|p| matches!(p.state, StageState::Done | StageState::Shortfall));
        if total == 0 && !failures.is_empty() && !any_settled_ok {
            return self.fail_run(state, &format!("all sources failed: {}", failures.join("; ")));
        }

        if let Some(sink_id) = &state.resources.output_sink {
            self.sink.finalize(sink_id).await?;
        }

        let shortfalls: Vec<Shortfall> = state
            .stage_order
            .iter()
            .filter(|s| state.availability.is_usable(s))
            .filter_map(|s| {
                let p = state.progress(s)?;
                (p.collected < p.target).then(|| Shortfall {
                    source: s.clone(),
                    collected: p.collected,
                    target: p.target,
                })
            })
            .collect();

        let (warning, snapshot) = if total == 0 {
            let snapshot = self.collectors.snapshot();
            let status = snapshot
                .iter()
                .map(|(name, a)| match &a.reason {
                    _ if a.usable => format!("{name}: usable"),
                    Some(reason) => format!("{name}: {reason}"),
                    None => format!("{name}: unusable"),
                })
                .collect::<Vec<_>>()
                .join("; ");
            let warning = format!("Run completed but collected no items. Source status: {status}");
            (Some(warning), Some(snapshot))
        } else {
            (None, None)
        };

        if let Some(root) = &state.resources.root_container {
            let manifest = json!({
                "run_id": state.run_id,
                "instruction": state.instruction,
                "plan": state.plan,
                "stages": state.stage_progress.iter().map(|(source, p)| json!({
                    "source": source,
                    "state": p.state,
                    "collected": p.collected,
                    "target": p.target,
                    "expansions": p.expansions,
                    "duplicates_dropped": p.duplicates_dropped,
                })).collect::<Vec<_>>(),
                "total_collected": total,
                "output_location": state.resources.output_location,
                "warning": warning,
                "finalized_at": now(),
            });
            self.artifacts.write_artifact(root, "manifest", &manifest).await?;
        }

        state.completion = Some(Completion {
            total_collected: total,
            shortfalls,
            warning: warning.clone(),
            availability: snapshot,
            completed_at: now(),
        });
        state.transition(RunStatus::Completed)?;
        state.lease = None;
        state.last_error = None;
        match warning {
            Some(warning) => {
                warn!(run_id = %state.run_id, "{warning}");
                state.set_message(warning);
            }
            None => state.set_message(format!("Completed with {total} item(s)")),
        }
        self.store.save(state)?;
        info!(run_id = %state.run_id, total, "Run completed");

        self.sweep();
        Ok(())
    }

    /// Best-effort retention after a completion.
    fn sweep(&self) {
        match self.store.prune(self.settings.keep_runs.max(1)) {
            Ok(report) if !report.deleted.is_empty() => {
                info!(deleted = report.deleted.len(), "Retention sweep removed old runs");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Retention sweep failed"),
        }
    }

    /// Persist a run failure and make sure no continuation points at it.
    fn fail_run(&self, state: &mut RunState, message: &str) -> Result<()> {
        self.scheduler.cancel(&state.run_id);
        state.lease = None;
        if let Err(e) = state.fail(message) {
            warn!(run_id = %state.run_id, error = %e, "Run already terminal");
        }
        self.store.save(state)?;
        error!(run_id = %state.run_id, error = message, "Run failed");
        Ok(())
    }
}

fn ensure_usable(availability: &SourceAvailability) -> Result<()> {
    if availability.any_usable() {
        return Ok(());
    }
    let mut details = availability.unusable_details();
    if details.is_empty() {
        details.push("no sources are registered".to_string());
    }
    Err(WorkflowError::NoUsableSources { details })
}
