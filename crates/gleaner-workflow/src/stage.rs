//! The per-stage collection routine.
//!
//! One call drives one source until it reaches its target, runs dry, fails,
//! or the invocation budget runs out. Rows are staged in memory and only
//! become part of the checkpoint once the sink has accepted them, so a crash
//! or a sink failure never leaves an id in the dedup ledger that the sink
//! did not receive.

use std::collections::HashSet;
use std::sync::Arc;

use gleaner_store::CheckpointStore;
use gleaner_types::{OutputRow, RunState, StageState};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactStore;
use crate::budget::Budget;
use crate::collector::StageCollector;
use crate::error::{StageFailure, WorkflowError};
use crate::retry::RetryExecutor;
use crate::sink::OutputSink;

/// How a stage routine returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Target reached.
    Completed,
    /// Source exhausted below target after all expansions.
    Shortfall,
    /// Source was not usable for this run.
    Skipped,
    /// Out of time; the stage resumes from its cursor next invocation.
    BudgetExhausted,
}

/// Rows accepted from the source but not yet written to the sink.
#[derive(Debug, Default)]
struct Staged {
    rows: Vec<OutputRow>,
    ids: HashSet<String>,
    /// Cursor to commit with the rows. `Some(None)` resets the cursor.
    cursor: Option<Option<String>>,
}

impl Staged {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn push(&mut self, row: OutputRow) {
        self.ids.insert(row.item_id.clone());
        self.rows.push(row);
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn is_clean(&self) -> bool {
        self.rows.is_empty() && self.cursor.is_none()
    }
}

/// Everything a stage needs besides the run itself.
pub(crate) struct StageRunner<'a> {
    pub store: &'a dyn CheckpointStore,
    pub sink: &'a dyn OutputSink,
    pub artifacts: &'a dyn ArtifactStore,
    pub retry: &'a RetryExecutor,
    pub batch_size: usize,
    pub max_expansions: u32,
}

impl StageRunner<'_> {
    /// Run the stage for `source`.
    ///
    /// A source failure is recorded on the stage (state `failed`, last error)
    /// and checkpointed before it is returned; any other error is an
    /// infrastructure failure that ends the run.
    pub async fn run(
        &self,
        state: &mut RunState,
        source: &str,
        collector: Option<&Arc<dyn StageCollector>>,
        budget: &Budget,
    ) -> Result<StageOutcome, StageFailure> {
        let run_id = state.run_id.clone();

        let collector = match collector {
            Some(c) if state.availability.is_usable(source) => c,
            _ => {
                let reason = state
                    .availability
                    .get(source)
                    .and_then(|a| a.reason.clone())
                    .unwrap_or_else(|| "no collector registered".to_string());
                let progress = state.progress_mut(source)?;
                progress.state = StageState::Skipped;
                progress.last_error = Some(reason.clone());
                self.store.save(state)?;
                info!(run_id = %run_id, source, reason = %reason, "Stage skipped");
                return Ok(StageOutcome::Skipped);
            }
        };

        let sink_id = state
            .resources
            .output_sink
            .clone()
            .ok_or_else(|| WorkflowError::Sink(format!("run {run_id} has no output sink")))?;
        let container = state
            .resources
            .source_containers
            .get(source)
            .or(state.resources.root_container.as_ref())
            .cloned();

        {
            let progress = state.progress_mut(source)?;
            if progress.state != StageState::Active {
                progress.state = StageState::Active;
                progress.last_error = None;
            }
        }

        let mut staged = Staged::default();

        loop {
            let Some(progress) = state.progress(source) else {
                return Err(gleaner_types::TypesError::UnknownStage(source.to_string()).into());
            };
            let target = progress.target;
            if progress.collected >= target {
                return self.complete(state, source).await;
            }
            let plan = state
                .plan
                .clone()
                .ok_or_else(|| WorkflowError::Planner(format!("run {run_id} has no plan")))?;
            // Staged rows carry the cursor past the pages they came from.
            let cursor = staged
                .cursor
                .clone()
                .unwrap_or_else(|| progress.cursor.clone());
            let max_items = (progress.remaining() as usize)
                .saturating_sub(staged.len())
                .clamp(1, self.batch_size.max(1));

            let fetched = self
                .retry
                .run_with_refresh(
                    source,
                    || collector.collect(&plan, cursor.as_deref(), max_items),
                    || collector.refresh_credentials(),
                )
                .await;

            let page = match fetched {
                Ok(page) => page,
                Err(error) => {
                    self.flush(state, &sink_id, source, &mut staged).await?;
                    let progress = state.progress_mut(source)?;
                    progress.state = StageState::Failed;
                    progress.last_error = Some(error.to_string());
                    self.store.save(state)?;
                    return Err(StageFailure::Source {
                        source_name: source.to_string(),
                        error,
                    });
                }
            };

            let Some(progress) = state.progress(source) else {
                return Err(gleaner_types::TypesError::UnknownStage(source.to_string()).into());
            };
            let mut accepted = progress.collected as usize + staged.len();
            let mut duplicates = 0u32;
            for item in &page.items {
                if accepted >= target as usize {
                    break;
                }
                if progress.has_processed(&item.id) || staged.contains(&item.id) {
                    duplicates += 1;
                    continue;
                }
                if let Some(container) = &container {
                    self.artifacts
                        .write_artifact(container, &item.id, &item.payload)
                        .await?;
                }
                staged.push(collector.normalize(item));
                accepted += 1;
            }
            staged.cursor = Some(page.next_cursor.clone());
            if duplicates > 0 {
                let progress = state.progress_mut(source)?;
                progress.duplicates_dropped += duplicates;
                debug!(run_id = %run_id, source, duplicates, "Dropped duplicate items");
            }

            if accepted >= target as usize {
                self.flush(state, &sink_id, source, &mut staged).await?;
                return self.complete(state, source).await;
            }

            if !page.has_more {
                self.flush(state, &sink_id, source, &mut staged).await?;
                let progress = state.progress_mut(source)?;
                let (collected, expansions) = (progress.collected, progress.expansions);

                let expanded = if expansions < self.max_expansions {
                    collector.expand(&plan, collected, target)
                } else {
                    None
                };
                match expanded {
                    Some(wider) => {
                        progress.expansions += 1;
                        progress.cursor = None;
                        if let (Some(strategy), Some(current)) =
                            (wider.strategy_for(source).cloned(), state.plan.as_mut())
                        {
                            current.set_strategy(source, strategy);
                        }
                        self.store.save(state)?;
                        info!(
                            run_id = %run_id,
                            source,
                            collected,
                            target,
                            expansion = expansions + 1,
                            "Source ran dry below target, widening query"
                        );
                    }
                    None => {
                        progress.state = StageState::Shortfall;
                        self.store.save(state)?;
                        warn!(run_id = %run_id, source, collected, target, "Stage finished short of target");
                        return Ok(StageOutcome::Shortfall);
                    }
                }
            } else if staged.len() >= self.batch_size {
                self.flush(state, &sink_id, source, &mut staged).await?;
            }

            if budget.is_exhausted() {
                self.flush(state, &sink_id, source, &mut staged).await?;
                let collected = state.progress(source).map_or(0, |p| p.collected);
                info!(
                    run_id = %run_id,
                    source,
                    collected,
                    target,
                    elapsed_ms = budget.elapsed().as_millis() as u64,
                    "Budget exhausted mid-stage"
                );
                return Ok(StageOutcome::BudgetExhausted);
            }
        }
    }

    async fn complete(
        &self,
        state: &mut RunState,
        source: &str,
    ) -> Result<StageOutcome, StageFailure> {
        let progress = state.progress_mut(source)?;
        progress.state = StageState::Done;
        let (collected, target) = (progress.collected, progress.target);
        self.store.save(state)?;
        info!(run_id = %state.run_id, source, collected, target, "Stage reached target");
        Ok(StageOutcome::Completed)
    }

    /// Hand staged rows to the sink, then commit ids, counters and cursor to
    /// the checkpoint.
    async fn flush(
        &self,
        state: &mut RunState,
        sink_id: &str,
        source: &str,
        staged: &mut Staged,
    ) -> Result<(), StageFailure> {
        if staged.is_clean() {
            return Ok(());
        }
        if !staged.rows.is_empty() {
            self.sink.append_rows(sink_id, source, &staged.rows).await?;
        }

        let rows = staged.rows.len();
        let progress = state.progress_mut(source)?;
        for row in staged.rows.drain(..) {
            progress.record(&row.item_id);
        }
        staged.ids.clear();
        if let Some(cursor) = staged.cursor.take() {
            progress.cursor = cursor;
        }
        let collected = progress.collected;
        self.store.save(state)?;
        debug!(run_id = %state.run_id, source, rows, collected, "Flushed batch");
        Ok(())
    }
}
