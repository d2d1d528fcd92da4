//! CLI command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use console::{Style, style};
use gleaner_config::{GleanerConfig, load_config, load_config_file, user_config_dir};
use gleaner_store::SqliteCheckpointStore;
use gleaner_types::{RunId, RunStatus, RunStatusView, StageState};
use gleaner_workflow::{
    CollectorRegistry, Continuation, FileCollector, FsArtifactStore, HeuristicPlanner, JsonlSink,
    Orchestrator, TokioTimerHost,
};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod cancel;
pub mod list;
pub mod prune;
pub mod resume;
pub mod retry;
pub mod sources;
pub mod start;
pub mod status;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective configuration.
    pub config: GleanerConfig,
    /// Directory relative source paths resolve against.
    pub base_dir: PathBuf,
    /// Checkpoint database.
    pub database: PathBuf,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Problems found while loading config layers.
    pub warnings: Vec<String>,
}

impl Context {
    /// Load configuration, either from an explicit file or by discovery.
    pub fn load(
        config_path: Option<&Path>,
        database: Option<PathBuf>,
        json_output: bool,
        verbose: bool,
    ) -> Result<Self> {
        let (config, base_dir, warnings) = match config_path {
            Some(path) => {
                let config = load_config_file(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?;
                config.validate()?;
                let base_dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (config, base_dir, Vec::new())
            }
            None => {
                let loaded = load_config(None)?;
                (loaded.config, PathBuf::from("."), loaded.warnings)
            }
        };
        let database = database.unwrap_or_else(|| config.storage().resolved_database());

        Ok(Self {
            config,
            base_dir,
            database,
            json_output,
            verbose,
            warnings,
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.storage().resolved_data_dir()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config
            .logging
            .as_ref()
            .and_then(|l| l.directory.clone())
            .or_else(|| user_config_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }

    /// One file-backed collector per `[[sources]]` table, in order.
    pub fn collectors(&self) -> Result<CollectorRegistry> {
        let mut registry = CollectorRegistry::new();
        for section in &self.config.sources {
            registry.register(Arc::new(FileCollector::from_section(section, &self.base_dir)))?;
        }
        Ok(registry)
    }

    /// Wire the orchestrator to on-disk collaborators and an in-process
    /// timer host.
    pub fn runtime(&self) -> Result<Runtime> {
        let store = SqliteCheckpointStore::open(&self.database)
            .with_context(|| format!("failed to open {}", self.database.display()))?;
        let data_dir = self.data_dir();
        let (timers, continuations) =
            TokioTimerHost::new(self.config.workflow().max_pending_timers);

        let orchestrator = Orchestrator::builder()
            .config(&self.config)
            .store(Arc::new(store))
            .collectors(self.collectors()?)
            .planner(Arc::new(HeuristicPlanner::new()))
            .sink(Arc::new(JsonlSink::new(data_dir.join("output"))))
            .artifacts(Arc::new(FsArtifactStore::new(data_dir.join("artifacts"))))
            .timer_host(Arc::new(timers))
            .build()?;

        Ok(Runtime {
            orchestrator,
            continuations,
        })
    }
}

/// An orchestrator plus the continuations its timers deliver.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    continuations: UnboundedReceiver<Continuation>,
}

impl Runtime {
    /// Serve continuations for `run_id` until the run is terminal.
    pub async fn drive(&mut self, run_id: &RunId) -> Result<RunStatusView> {
        loop {
            let view = self.orchestrator.get_run_status(run_id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            if !view.continuation_pending {
                bail!("run {run_id} has no continuation scheduled; try `gleaner retry {run_id}`");
            }

            let Some(continuation) = self.continuations.recv().await else {
                bail!("timer host shut down");
            };
            // The other run keeps its lease in the store for `gleaner continue`.
            if &continuation.run_id != run_id {
                tracing::debug!(
                    run_id = %continuation.run_id,
                    driving = %run_id,
                    "Leaving continuation for another run"
                );
                continue;
            }
            let invocation = self
                .orchestrator
                .continue_run(&continuation.run_id, Some(&continuation.token))
                .await?;
            tracing::debug!(run_id = %run_id, ?invocation, "Invocation finished");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).with_context(|| format!("'{raw}' is not a run id"))
}

pub fn status_style(status: &RunStatus) -> Style {
    match status {
        RunStatus::Completed => Style::new().green(),
        RunStatus::Failed => Style::new().red(),
        _ => Style::new().yellow(),
    }
}

fn stage_style(state: StageState) -> Style {
    match state {
        StageState::Done => Style::new().green(),
        StageState::Failed => Style::new().red(),
        StageState::Shortfall | StageState::Skipped => Style::new().yellow(),
        StageState::Pending | StageState::Active => Style::new().dim(),
    }
}

/// Print a run status view, as JSON or for humans.
pub fn print_view(view: &RunStatusView, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        return print_json(view);
    }

    let dim = Style::new().dim();
    println!();
    println!("{} {}", style("Run").bold(), view.run_id);
    println!("{}", dim.apply_to("─".repeat(40)));
    println!(
        "  {} {}",
        dim.apply_to("Status:"),
        status_style(&view.status).apply_to(format!("● {}", view.status))
    );
    println!("  {} {}", dim.apply_to("Collected:"), view.total_collected);
    if let Some(location) = &view.output_location {
        println!("  {} {}", dim.apply_to("Output:"), location);
    }
    if let Some(message) = &view.last_message {
        println!("  {} {}", dim.apply_to("Message:"), message);
    }
    if let Some(error) = &view.last_error {
        println!("  {} {}", dim.apply_to("Error:"), Style::new().red().apply_to(error));
    }
    if view.empty_result {
        println!(
            "  {} {}",
            Style::new().yellow().apply_to("⚠"),
            view.warning.as_deref().unwrap_or("no items were collected")
        );
    }

    if !view.per_source.is_empty() {
        println!();
        for source in &view.per_source {
            println!(
                "  {:<16} {:>5}/{:<5} {}",
                source.source,
                source.collected,
                source.target,
                stage_style(source.state).apply_to(source.state)
            );
            if ctx.verbose {
                if source.expansions > 0 || source.duplicates_dropped > 0 {
                    println!(
                        "  {:<16} {}",
                        "",
                        dim.apply_to(format!(
                            "expansions {}, duplicates dropped {}",
                            source.expansions, source.duplicates_dropped
                        ))
                    );
                }
                if let Some(error) = &source.last_error {
                    println!("  {:<16} {}", "", dim.apply_to(error));
                }
            }
        }
    }

    if view.continuation_pending && !view.status.is_terminal() {
        println!();
        println!(
            "  {}",
            dim.apply_to(format!("Continue with: gleaner continue {}", view.run_id))
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleaner_types::RunOptions;
    use std::io::Write;

    #[test]
    fn test_context_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gleaner.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[[sources]]\nname = \"news\"\npath = \"news.jsonl\"\n\n[storage]\ndata_dir = \"{}\"",
            dir.path().display()
        )
        .unwrap();

        let ctx = Context::load(Some(&path), None, false, false).unwrap();
        assert_eq!(ctx.base_dir, dir.path());
        assert_eq!(ctx.database, dir.path().join("runs.db"));

        let registry = ctx.collectors().unwrap();
        assert_eq!(registry.names(), vec!["news"]);
        assert!(!registry.snapshot().is_usable("news"));
    }

    #[tokio::test]
    async fn test_drive_leaves_other_runs_pending() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<String> = (1..=4)
            .map(|i| format!(r#"{{"id": "n{i}", "title": "story {i}"}}"#))
            .collect();
        std::fs::write(dir.path().join("news.jsonl"), lines.join("\n")).unwrap();
        let path = dir.path().join("gleaner.toml");
        std::fs::write(
            &path,
            format!(
                "[workflow]\ncontinuation_delay_secs = 0\n\n[storage]\ndata_dir = \"{}\"\n\n\
                 [[sources]]\nname = \"news\"\npath = \"news.jsonl\"\n",
                dir.path().display()
            ),
        )
        .unwrap();

        let ctx = Context::load(Some(&path), None, false, false).unwrap();
        let mut runtime = ctx.runtime().unwrap();
        let first = runtime
            .orchestrator
            .start_run("collect 2 items", RunOptions::default())
            .await
            .unwrap();
        let second = runtime
            .orchestrator
            .start_run("collect 2 items", RunOptions::default())
            .await
            .unwrap();

        let view = runtime.drive(&first.run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Completed);

        let other = runtime.orchestrator.get_run_status(&second.run_id).unwrap();
        assert!(!other.status.is_terminal());
        assert!(other.continuation_pending);

        for _ in 0..5 {
            if runtime.orchestrator.continue_pending().await.unwrap().is_empty() {
                break;
            }
        }
        let other = runtime.orchestrator.get_run_status(&second.run_id).unwrap();
        assert_eq!(other.status, RunStatus::Completed);
    }

    #[test]
    fn test_parse_run_id() {
        assert!(parse_run_id("nope").is_err());
        let id = RunId::generate();
        assert_eq!(parse_run_id(id.as_str()).unwrap(), id);
    }
}
