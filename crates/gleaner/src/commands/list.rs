//! List command - recent runs.

use anyhow::Result;
use clap::Args;
use console::{Style, style};

use super::{Context, print_json, status_style};

/// Arguments for the list command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Maximum number of runs to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,
}

/// Run the list command.
pub async fn run(args: ListArgs, ctx: &Context) -> Result<()> {
    let runtime = ctx.runtime()?;
    let runs = runtime.orchestrator.list_runs(args.limit)?;

    if ctx.json_output {
        return print_json(&runs);
    }

    let dim = Style::new().dim();
    if runs.is_empty() {
        println!("{}", dim.apply_to("No runs"));
        return Ok(());
    }

    println!();
    println!("{}", style("Recent runs").bold());
    println!("{}", dim.apply_to("─".repeat(72)));
    for run in &runs {
        let pending = if run.pending { "⏱" } else { " " };
        println!(
            "  {}  {:<22} {} {}",
            run.run_id,
            status_style(&run.status).apply_to(run.status.to_string()),
            pending,
            dim.apply_to(run.updated_at.format("%Y-%m-%d %H:%M:%S"))
        );
    }
    println!();
    Ok(())
}
