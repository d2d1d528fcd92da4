//! Prune command - retention sweep.

use anyhow::Result;
use clap::Args;
use console::Style;

use super::{Context, print_json};

/// Arguments for the prune command.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Runs to keep (default: retention.keep_runs)
    #[arg(short, long)]
    pub keep: Option<usize>,
}

/// Run the prune command.
pub async fn run(args: PruneArgs, ctx: &Context) -> Result<()> {
    let keep = args
        .keep
        .unwrap_or_else(|| ctx.config.retention().keep_runs);
    let runtime = ctx.runtime()?;
    let report = runtime.orchestrator.prune(keep)?;

    if ctx.json_output {
        return print_json(&report);
    }

    let dim = Style::new().dim();
    println!(
        "Deleted {} of {} run(s), keeping {}",
        report.deleted.len(),
        report.examined,
        keep
    );
    if report.kept_active > 0 {
        println!(
            "{}",
            dim.apply_to(format!(
                "{} older run(s) are still active and were kept",
                report.kept_active
            ))
        );
    }
    if ctx.verbose {
        for run_id in &report.deleted {
            println!("  {}", dim.apply_to(run_id));
        }
    }
    Ok(())
}
