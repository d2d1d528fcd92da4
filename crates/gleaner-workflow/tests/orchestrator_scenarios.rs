//! End-to-end orchestrator scenarios against in-memory collaborators.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use gleaner_store::{CheckpointStore, MemoryCheckpointStore};
use gleaner_types::{RunId, RunOptions, RunState, RunStatus, StageState};
use gleaner_workflow::{
    CollectorRegistry, Invocation, ManualTimerHost, MemoryArtifactStore, MemorySink,
    Orchestrator, RetryExecutor, RetryPolicy, ScriptedCollector, SourceError, StageCollector,
    WorkflowError, WorkflowSettings,
};

struct Harness {
    store: Arc<MemoryCheckpointStore>,
    sink: Arc<MemorySink>,
    artifacts: Arc<MemoryArtifactStore>,
    timers: Arc<ManualTimerHost>,
    orchestrator: Orchestrator,
}

fn settings(budget_secs: u64) -> WorkflowSettings {
    WorkflowSettings {
        budget: Duration::from_secs(budget_secs),
        batch_size: 25,
        max_expansions: 2,
        continuation_delay: Duration::from_secs(5),
        keep_runs: 20,
    }
}

fn harness(collectors: Vec<Arc<ScriptedCollector>>, settings: WorkflowSettings) -> Harness {
    harness_with_retry(collectors, settings, RetryPolicy::immediate(0))
}

fn harness_with_retry(
    collectors: Vec<Arc<ScriptedCollector>>,
    settings: WorkflowSettings,
    retry: RetryPolicy,
) -> Harness {
    let mut registry = CollectorRegistry::new();
    for collector in collectors {
        let collector: Arc<dyn StageCollector> = collector;
        registry.register(collector).unwrap();
    }

    let store = Arc::new(MemoryCheckpointStore::new());
    let sink = Arc::new(MemorySink::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let timers = Arc::new(ManualTimerHost::default());

    let orchestrator = Orchestrator::builder()
        .settings(settings)
        .store(store.clone())
        .collectors(registry)
        .sink(sink.clone())
        .artifacts(artifacts.clone())
        .timer_host(timers.clone())
        .retry(RetryExecutor::new(retry))
        .build()
        .unwrap();

    Harness {
        store,
        sink,
        artifacts,
        timers,
        orchestrator,
    }
}

fn targets(pairs: &[(&str, u32)]) -> RunOptions {
    RunOptions {
        target_overrides: pairs
            .iter()
            .map(|(s, n)| (s.to_string(), *n))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

impl Harness {
    fn load(&self, run_id: &RunId) -> RunState {
        self.store.load(run_id).unwrap().unwrap()
    }

    fn sink_ids(&self, run_id: &RunId) -> Vec<String> {
        let state = self.load(run_id);
        let sink_id = state.resources.output_sink.unwrap();
        self.sink
            .rows(&sink_id)
            .into_iter()
            .map(|r| format!("{}:{}", r.source, r.item_id))
            .collect()
    }

    /// Fire timers until none are left.
    async fn drain(&self) -> Vec<Invocation> {
        let mut invocations = Vec::new();
        while let Some(continuation) = self.timers.fire_next() {
            let invocation = self
                .orchestrator
                .continue_run(&continuation.run_id, Some(&continuation.token))
                .await
                .unwrap();
            invocations.push(invocation);
        }
        invocations
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Happy path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_collects_exact_target_across_pages() {
    let news = Arc::new(ScriptedCollector::new("news").with_pages(vec![
        ScriptedCollector::numbered("n", 0..5),
        ScriptedCollector::numbered("n", 5..10),
        ScriptedCollector::numbered("n", 10..12),
    ]));
    let h = harness(vec![news.clone()], settings(5));

    let started = h
        .orchestrator
        .start_run("collect rust news", targets(&[("news", 12)]))
        .await
        .unwrap();
    assert_eq!(started.status, RunStatus::Collecting("news".into()));
    assert_eq!(
        started.output_location.as_deref(),
        Some(format!("memory://mem-{}", started.run_id).as_str())
    );
    assert!(news.calls().is_empty(), "start_run must not collect");
    assert_eq!(h.timers.len(), 1);

    let invocations = h.drain().await;
    assert_eq!(invocations, vec![Invocation::Finished(RunStatus::Completed)]);
    // Pages smaller than a batch still move the cursor forward.
    let cursors: Vec<Option<String>> = news.calls().into_iter().map(|c| c.cursor).collect();
    assert_eq!(
        cursors,
        vec![None, Some("1".to_string()), Some("2".to_string())]
    );

    let state = h.load(&started.run_id);
    let progress = state.progress("news").unwrap();
    assert_eq!(progress.collected, 12);
    assert_eq!(progress.duplicates_dropped, 0);
    assert_eq!(progress.state, StageState::Done);
    assert!(state.lease.is_none());
    assert!(h.timers.is_empty());

    let completion = state.completion.unwrap();
    assert_eq!(completion.total_collected, 12);
    assert!(completion.shortfalls.is_empty());
    assert!(completion.warning.is_none());

    let sink_id = state.resources.output_sink.unwrap();
    assert_eq!(h.sink.rows(&sink_id).len(), 12);
    assert!(h.sink.is_finalized(&sink_id));

    let root = state.resources.root_container.unwrap();
    let manifest = h.artifacts.artifact(&root, "manifest").unwrap();
    assert_eq!(manifest["total_collected"], 12);
    assert_eq!(h.artifacts.count(&format!("{}/news", started.run_id)), 12);
}

#[tokio::test]
async fn test_planner_targets_and_overrides() {
    let news = Arc::new(ScriptedCollector::new("news").with_default_target(3));
    let forum = Arc::new(ScriptedCollector::new("forum").with_default_target(4));
    let h = harness(vec![news, forum], settings(5));

    let started = h
        .orchestrator
        .start_run("find 6 news about tokio", targets(&[("forum", 2)]))
        .await
        .unwrap();

    let state = h.load(&started.run_id);
    let plan = state.plan.unwrap();
    assert_eq!(plan.target_for("news"), 6);
    assert_eq!(plan.target_for("forum"), 2);
    assert_eq!(state.stage_order, vec!["news", "forum"]);
    assert!(plan.search_terms.contains(&"tokio".to_string()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Budget & resumption
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_budget_exhaustion_resumes_from_cursor() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![
                ScriptedCollector::numbered("n", 0..5),
                ScriptedCollector::numbered("n", 5..10),
            ])
            .with_page_delay(Duration::from_secs(70)),
    );
    let h = harness(vec![news.clone()], settings(60));

    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 10)]))
        .await
        .unwrap();

    let first = h.timers.fire_next().unwrap();
    let invocation = h
        .orchestrator
        .continue_run(&first.run_id, Some(&first.token))
        .await
        .unwrap();
    assert_eq!(
        invocation,
        Invocation::Suspended {
            stage: "news".into()
        }
    );

    let state = h.load(&started.run_id);
    let progress = state.progress("news").unwrap();
    assert_eq!(progress.collected, 5);
    assert_eq!(progress.cursor.as_deref(), Some("1"));
    assert_eq!(state.status, RunStatus::Collecting("news".into()));
    assert!(state.lease.is_some());
    assert_eq!(h.timers.len(), 1);

    let rest = h.drain().await;
    assert_eq!(rest, vec![Invocation::Finished(RunStatus::Completed)]);

    let cursors: Vec<Option<String>> = news.calls().into_iter().map(|c| c.cursor).collect();
    assert_eq!(cursors, vec![None, Some("1".to_string())]);
    assert_eq!(h.load(&started.run_id).progress("news").unwrap().collected, 10);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_across_invocations() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![
                ScriptedCollector::numbered("n", 0..4),
                ScriptedCollector::page(["n3", "n4", "n5"]),
                ScriptedCollector::numbered("n", 6..9),
            ])
            .with_page_delay(Duration::from_secs(70)),
    );
    let h = harness(vec![news], settings(60));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 50)]))
        .await
        .unwrap();

    let mut last_collected = 0;
    let mut last_ids = HashSet::new();
    while let Some(c) = h.timers.fire_next() {
        h.orchestrator
            .continue_run(&c.run_id, Some(&c.token))
            .await
            .unwrap();
        let progress = h.load(&started.run_id).progress("news").cloned().unwrap();
        assert!(progress.collected >= last_collected);
        let ids: HashSet<String> = progress.processed_ids.iter().cloned().collect();
        assert!(ids.is_superset(&last_ids));
        last_collected = progress.collected;
        last_ids = ids;
    }

    let state = h.load(&started.run_id);
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(last_collected, 9);
    assert_eq!(state.progress("news").unwrap().duplicates_dropped, 1);
}

fn paged_news(delay: Duration) -> Arc<ScriptedCollector> {
    Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![
                ScriptedCollector::page(["a", "b", "c"]),
                ScriptedCollector::page(["c", "d"]),
                ScriptedCollector::page(["e", "f", "a"]),
            ])
            .with_expansion_pages(vec![ScriptedCollector::page(["g", "b", "h"])])
            .with_page_delay(delay),
    )
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_run_matches_uninterrupted_run() {
    let whole = harness(vec![paged_news(Duration::from_secs(70))], settings(3600));
    let run = whole
        .orchestrator
        .start_run("news", targets(&[("news", 20)]))
        .await
        .unwrap();
    let invocations = whole.drain().await;
    assert_eq!(invocations.len(), 1);

    let pieces = harness(vec![paged_news(Duration::from_secs(70))], settings(60));
    let interrupted = pieces
        .orchestrator
        .start_run("news", targets(&[("news", 20)]))
        .await
        .unwrap();
    let invocations = pieces.drain().await;
    assert!(invocations.len() > 1);
    assert!(invocations[..invocations.len() - 1]
        .iter()
        .all(Invocation::is_suspended));

    assert_eq!(whole.sink_ids(&run.run_id), pieces.sink_ids(&interrupted.run_id));
    assert_eq!(
        whole.load(&run.run_id).progress("news").unwrap().collected,
        pieces.load(&interrupted.run_id).progress("news").unwrap().collected,
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Dedup & shortfall
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sink_never_receives_duplicates() {
    let h = harness(vec![paged_news(Duration::ZERO)], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 20)]))
        .await
        .unwrap();
    h.drain().await;

    let ids = h.sink_ids(&started.run_id);
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len());
    assert_eq!(ids.len(), 8);

    let progress = h.load(&started.run_id).progress("news").cloned().unwrap();
    assert_eq!(progress.duplicates_dropped, 3);
}

#[tokio::test]
async fn test_shortfall_after_bounded_expansion() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![ScriptedCollector::numbered("n", 0..4)])
            .with_expansion_pages(vec![ScriptedCollector::page(["n3", "n4", "n5", "n6"])]),
    );
    let h = harness(vec![news.clone()], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 10)]))
        .await
        .unwrap();

    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Completed)]
    );

    let state = h.load(&started.run_id);
    let progress = state.progress("news").unwrap();
    assert_eq!(progress.collected, 7);
    assert_eq!(progress.expansions, 1);
    assert_eq!(progress.state, StageState::Shortfall);

    let levels: Vec<usize> = news.calls().into_iter().map(|c| c.expansion).collect();
    assert_eq!(levels, vec![0, 1]);

    let completion = state.completion.unwrap();
    assert_eq!(completion.shortfalls.len(), 1);
    assert_eq!(completion.shortfalls[0].collected, 7);
    assert_eq!(completion.shortfalls[0].target, 10);
}

// ─────────────────────────────────────────────────────────────────────────────
// Preconditions & empty results
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_fails_fast_without_usable_sources() {
    let news =
        Arc::new(ScriptedCollector::new("news").unusable("missing setting sources.news.path"));
    let h = harness(vec![news], settings(5));

    let err = h
        .orchestrator
        .start_run("news", RunOptions::default())
        .await
        .unwrap_err();

    match &err {
        WorkflowError::NoUsableSources { details } => {
            assert_eq!(details, &vec!["news: missing setting sources.news.path".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.orchestrator.list_runs(10).unwrap().is_empty());
    assert!(h.timers.is_empty());
    assert_eq!(h.sink.created_count(), 0);
}

#[tokio::test]
async fn test_zero_collected_run_is_flagged() {
    let news = Arc::new(ScriptedCollector::new("news"));
    let forum = Arc::new(ScriptedCollector::new("forum").unusable("disabled"));
    let h = harness(vec![news, forum.clone()], settings(5));
    let started = h
        .orchestrator
        .start_run("news", RunOptions::default())
        .await
        .unwrap();
    h.drain().await;

    let view = h.orchestrator.get_run_status(&started.run_id).unwrap();
    assert_eq!(view.status, RunStatus::Completed);
    assert!(view.empty_result);
    let warning = view.warning.unwrap();
    assert!(warning.contains("collected no items"));
    assert!(warning.contains("forum: disabled"));

    let state = h.load(&started.run_id);
    let snapshot = state.completion.as_ref().unwrap().availability.clone().unwrap();
    assert!(snapshot.is_usable("news"));
    assert!(!snapshot.is_usable("forum"));
    assert_eq!(state.progress("forum").unwrap().state, StageState::Skipped);
    assert!(forum.calls().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Re-entrancy
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reentry_after_completion_is_a_noop() {
    let news = Arc::new(
        ScriptedCollector::new("news").with_pages(vec![ScriptedCollector::numbered("n", 0..3)]),
    );
    let h = harness(vec![news.clone()], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 3)]))
        .await
        .unwrap();
    h.drain().await;
    let before = h.load(&started.run_id);

    let again = h
        .orchestrator
        .continue_run(&started.run_id, None)
        .await
        .unwrap();
    assert_eq!(again, Invocation::AlreadyTerminal(RunStatus::Completed));
    assert_eq!(h.load(&started.run_id), before);
    assert_eq!(news.calls().len(), 1);

    assert!(h.orchestrator.continue_pending().await.unwrap().is_empty());
    assert_eq!(
        h.orchestrator
            .continue_run(&RunId::generate(), None)
            .await
            .unwrap(),
        Invocation::NoRun
    );
}

#[tokio::test]
async fn test_terminal_run_clears_leftover_lease() {
    let news = Arc::new(ScriptedCollector::new("news"));
    let h = harness(vec![news], settings(5));
    let started = h
        .orchestrator
        .start_run("news", RunOptions::default())
        .await
        .unwrap();

    // Force a terminal run that still carries a lease.
    let mut state = h.load(&started.run_id);
    let token = state.lease.as_ref().unwrap().token.clone();
    state.status = RunStatus::Failed;
    h.store.save(&mut state).unwrap();

    let invocation = h
        .orchestrator
        .continue_run(&started.run_id, Some(&token))
        .await
        .unwrap();
    assert_eq!(invocation, Invocation::AlreadyTerminal(RunStatus::Failed));
    assert!(h.load(&started.run_id).lease.is_none());
    assert!(h.timers.is_empty());
}

#[tokio::test]
async fn test_terminal_run_clears_lease_for_any_token() {
    let news = Arc::new(ScriptedCollector::new("news"));
    let h = harness(vec![news.clone()], settings(5));
    let started = h
        .orchestrator
        .start_run("news", RunOptions::default())
        .await
        .unwrap();

    let mut state = h.load(&started.run_id);
    assert!(state.lease.is_some());
    state.status = RunStatus::Failed;
    h.store.save(&mut state).unwrap();

    // A callback from an older lease still finds the run terminal.
    let invocation = h
        .orchestrator
        .continue_run(&started.run_id, Some("an-older-token"))
        .await
        .unwrap();
    assert_eq!(invocation, Invocation::AlreadyTerminal(RunStatus::Failed));
    assert!(h.load(&started.run_id).lease.is_none());
    assert!(h.timers.is_empty());
    assert!(news.calls().is_empty());
}

#[tokio::test]
async fn test_stale_token_is_ignored() {
    let news = Arc::new(
        ScriptedCollector::new("news").with_pages(vec![ScriptedCollector::numbered("n", 0..3)]),
    );
    let h = harness(vec![news.clone()], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 3)]))
        .await
        .unwrap();
    let continuation = h.timers.fire_next().unwrap();

    let stale = h
        .orchestrator
        .continue_run(&started.run_id, Some("not-the-token"))
        .await
        .unwrap();
    assert_eq!(stale, Invocation::Stale);
    assert!(news.calls().is_empty());
    assert!(h.load(&started.run_id).lease.is_some());

    let live = h
        .orchestrator
        .continue_run(&started.run_id, Some(&continuation.token))
        .await
        .unwrap();
    assert_eq!(live, Invocation::Finished(RunStatus::Completed));

    // The same callback delivered twice.
    let duplicate = h
        .orchestrator
        .continue_run(&started.run_id, Some(&continuation.token))
        .await
        .unwrap();
    assert_eq!(duplicate, Invocation::Stale);
    assert_eq!(news.calls().len(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_keep_separate_leases() {
    let news = Arc::new(
        ScriptedCollector::new("news").with_pages(vec![ScriptedCollector::numbered("n", 0..3)]),
    );
    let h = harness(vec![news], settings(5));
    let a = h
        .orchestrator
        .start_run("first", targets(&[("news", 3)]))
        .await
        .unwrap();
    let b = h
        .orchestrator
        .start_run("second", targets(&[("news", 3)]))
        .await
        .unwrap();
    assert_eq!(h.timers.len(), 2);

    let results = h.orchestrator.continue_pending().await.unwrap();
    let ids: Vec<RunId> = results.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids, vec![a.run_id.clone(), b.run_id.clone()]);
    assert!(results
        .iter()
        .all(|(_, inv)| *inv == Invocation::Finished(RunStatus::Completed)));
    assert!(h.timers.is_empty());

    assert_eq!(h.sink_ids(&a.run_id).len(), 3);
    assert_eq!(h.sink_ids(&b.run_id).len(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancel & retry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancel_then_retry_resumes() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![
                ScriptedCollector::numbered("n", 0..5),
                ScriptedCollector::numbered("n", 5..10),
            ])
            .with_page_delay(Duration::from_secs(70)),
    );
    let h = harness(vec![news.clone()], settings(60));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 10)]))
        .await
        .unwrap();
    let first = h.timers.fire_next().unwrap();
    h.orchestrator
        .continue_run(&first.run_id, Some(&first.token))
        .await
        .unwrap();
    assert_eq!(h.timers.len(), 1);

    let cancelled = h.orchestrator.cancel_run(&started.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    assert!(!cancelled.continuation_pending);
    assert!(h.timers.is_empty());

    let err = h.orchestrator.cancel_run(&started.run_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { operation: "cancel", .. }));

    let retried = h.orchestrator.retry_run(&started.run_id).await.unwrap();
    assert_eq!(retried.status, RunStatus::Collecting("news".into()));
    assert!(retried.last_error.is_none());
    assert!(retried.continuation_pending);
    assert_eq!(h.timers.len(), 1);

    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Completed)]
    );
    assert_eq!(h.sink_ids(&started.run_id).len(), 10);

    let err = h.orchestrator.retry_run(&started.run_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { operation: "retry", .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_invocation_wins() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![ScriptedCollector::numbered("n", 0..5)])
            .with_page_delay(Duration::from_secs(10)),
    );
    let h = harness(vec![news], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 5)]))
        .await
        .unwrap();
    let continuation = h.timers.fire_next().unwrap();

    let (invocation, cancelled) = tokio::join!(
        h.orchestrator
            .continue_run(&continuation.run_id, Some(&continuation.token)),
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.orchestrator.cancel_run(&started.run_id).await
        }
    );

    assert_eq!(invocation.unwrap(), Invocation::Superseded);
    assert_eq!(cancelled.unwrap().status, RunStatus::Failed);

    let state = h.load(&started.run_id);
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_cancel_mid_fetch_keeps_sink_unique() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![ScriptedCollector::numbered("n", 0..5)])
            .with_page_delay(Duration::from_secs(10)),
    );
    let h = harness(vec![news.clone()], settings(60));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 5)]))
        .await
        .unwrap();
    let continuation = h.timers.fire_next().unwrap();

    // The cancelled invocation still hands its rows to the sink before its
    // checkpoint save loses the race.
    let (invocation, _) = tokio::join!(
        h.orchestrator
            .continue_run(&continuation.run_id, Some(&continuation.token)),
        async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.orchestrator.cancel_run(&started.run_id).await
        }
    );
    assert_eq!(invocation.unwrap(), Invocation::Superseded);
    assert_eq!(h.sink_ids(&started.run_id).len(), 5);
    assert_eq!(h.load(&started.run_id).progress("news").unwrap().collected, 0);

    h.orchestrator.retry_run(&started.run_id).await.unwrap();
    let invocations = h.drain().await;
    assert_eq!(
        invocations.last(),
        Some(&Invocation::Finished(RunStatus::Completed))
    );
    // The retry fetched the same page again.
    assert_eq!(news.calls().len(), 2);

    let ids = h.sink_ids(&started.run_id);
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(unique.len(), 5);
    assert_eq!(h.load(&started.run_id).progress("news").unwrap().collected, 5);
}

#[tokio::test]
async fn test_unknown_run_operations() {
    let h = harness(vec![Arc::new(ScriptedCollector::new("news"))], settings(5));
    let missing = RunId::generate();
    assert!(matches!(
        h.orchestrator.get_run_status(&missing),
        Err(WorkflowError::RunNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.cancel_run(&missing).await,
        Err(WorkflowError::RunNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.retry_run(&missing).await,
        Err(WorkflowError::RunNotFound(_))
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stage_failure_moves_to_next_stage() {
    let forum = Arc::new(
        ScriptedCollector::new("forum").failing(SourceError::http(503, "service unavailable")),
    );
    let news = Arc::new(
        ScriptedCollector::new("news").with_pages(vec![ScriptedCollector::numbered("n", 0..4)]),
    );
    let h = harness_with_retry(
        vec![forum.clone(), news],
        settings(5),
        RetryPolicy::immediate(2),
    );
    let started = h
        .orchestrator
        .start_run("news", targets(&[("forum", 5), ("news", 4)]))
        .await
        .unwrap();

    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Completed)]
    );
    assert_eq!(forum.calls().len(), 3);

    let view = h.orchestrator.get_run_status(&started.run_id).unwrap();
    let forum_view = view.per_source.iter().find(|p| p.source == "forum").unwrap();
    assert_eq!(forum_view.state, StageState::Failed);
    assert!(forum_view.last_error.as_deref().unwrap().contains("503"));
    assert_eq!(view.total_collected, 4);
    assert!(!view.empty_result);
}

#[tokio::test]
async fn test_every_stage_failing_fails_the_run() {
    let news = Arc::new(ScriptedCollector::new("news").failing(SourceError::auth("bad key")));
    let h = harness(vec![news], settings(5));
    let started = h
        .orchestrator
        .start_run("news", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Failed)]
    );
    let view = h.orchestrator.get_run_status(&started.run_id).unwrap();
    assert!(view.last_error.unwrap().contains("all sources failed"));
    assert!(!view.continuation_pending);
}

#[tokio::test]
async fn test_sink_failure_fails_run_and_retry_recovers() {
    let news = Arc::new(
        ScriptedCollector::new("news").with_pages(vec![ScriptedCollector::numbered("n", 0..4)]),
    );
    let h = harness(vec![news], settings(5));
    let started = h
        .orchestrator
        .start_run("news", targets(&[("news", 4)]))
        .await
        .unwrap();

    h.sink.fail_appends(true);
    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Failed)]
    );
    let state = h.load(&started.run_id);
    assert!(state.lease.is_none());
    assert!(state.last_error.as_deref().unwrap().contains("append rejected"));
    assert_eq!(state.progress("news").unwrap().collected, 0);
    assert!(h.timers.is_empty());

    h.sink.fail_appends(false);
    h.orchestrator.retry_run(&started.run_id).await.unwrap();
    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Completed)]
    );
    assert_eq!(h.sink_ids(&started.run_id).len(), 4);
    // Resources were created once and reused by the retry.
    assert_eq!(h.sink.created_count(), 1);
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let news = Arc::new(
        ScriptedCollector::new("news")
            .with_pages(vec![ScriptedCollector::numbered("n", 0..2)])
            .with_refresh(true),
    );
    news.fail_next(SourceError::token_expired("token expired"));
    let h = harness(vec![news.clone()], settings(5));
    h.orchestrator
        .start_run("news", targets(&[("news", 2)]))
        .await
        .unwrap();

    assert_eq!(
        h.drain().await,
        vec![Invocation::Finished(RunStatus::Completed)]
    );
    assert_eq!(news.refresh_count(), 1);
}

#[tokio::test]
async fn test_timer_quota_exhaustion_fails_start() {
    let news = Arc::new(ScriptedCollector::new("news"));
    let mut registry = CollectorRegistry::new();
    registry.register(news).unwrap();
    let timers = Arc::new(ManualTimerHost::new(1));
    let orchestrator = Orchestrator::builder()
        .settings(settings(5))
        .store(Arc::new(MemoryCheckpointStore::new()))
        .collectors(registry)
        .sink(Arc::new(MemorySink::new()))
        .artifacts(Arc::new(MemoryArtifactStore::new()))
        .timer_host(timers.clone())
        .build()
        .unwrap();

    let first = orchestrator.start_run("a", RunOptions::default()).await.unwrap();
    assert!(first.last_error.is_none());

    let second = orchestrator.start_run("b", RunOptions::default()).await.unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert!(second.last_error.unwrap().contains("quota"));
    assert_eq!(timers.len(), 1);
}
