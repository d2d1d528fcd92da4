//! Gleaner - resumable, budgeted multi-source collection runs
//!
//! Main entry point for the Gleaner CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{cancel, list, prune, resume, retry, sources, start, status};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Gleaner - resumable, budgeted multi-source collection runs
#[derive(Parser)]
#[command(name = "gleaner")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of discovering layers
    #[arg(long, global = true, env = "GLEANER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Checkpoint database path
    #[arg(long, global = true, env = "GLEANER_DATABASE")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a collection run
    Start(start::StartArgs),

    /// Start a run and drive it to completion in this process
    Run(start::StartArgs),

    /// Continue pending runs (or one run by id)
    #[command(name = "continue")]
    Continue(resume::ContinueArgs),

    /// Show the status of a run
    Status(status::StatusArgs),

    /// Cancel a run
    Cancel(cancel::CancelArgs),

    /// Retry a failed run from where it stopped
    Retry(retry::RetryArgs),

    /// List recent runs
    List(list::ListArgs),

    /// Delete old finished runs
    Prune(prune::PruneArgs),

    /// Show configured sources and whether they are usable
    Sources(sources::SourcesArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = commands::Context::load(
        cli.config.as_deref(),
        cli.database.clone(),
        cli.json,
        cli.verbose,
    )?;

    // Initialize tracing: console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "gleaner=debug,gleaner_workflow=debug,gleaner_store=debug,gleaner_config=debug,info"
    } else {
        "gleaner=info,gleaner_workflow=info,gleaner_store=warn,warn"
    };

    let log_dir = ctx.log_dir();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "gleaner.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "gleaner=trace,gleaner_workflow=trace,gleaner_store=trace,gleaner_config=trace,info",
                )),
        )
        .init();

    for warning in &ctx.warnings {
        tracing::warn!("{warning}");
    }

    // Dispatch to command handlers
    match cli.command {
        Commands::Start(args) => start::run(args, &ctx).await,
        Commands::Run(args) => start::run(args.waiting(), &ctx).await,
        Commands::Continue(args) => resume::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Cancel(args) => cancel::run(args, &ctx).await,
        Commands::Retry(args) => retry::run(args, &ctx).await,
        Commands::List(args) => list::run(args, &ctx).await,
        Commands::Prune(args) => prune::run(args, &ctx).await,
        Commands::Sources(args) => sources::run(args, &ctx).await,
    }
}
