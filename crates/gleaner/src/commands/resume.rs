//! Continue command - run the continuation entry point.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use gleaner_types::RunId;
use gleaner_workflow::Invocation;
use serde::Serialize;

use super::{Context, parse_run_id, print_json};

/// Arguments for the continue command.
#[derive(Args, Debug)]
pub struct ContinueArgs {
    /// Run to continue (default: every run with a pending continuation)
    pub run_id: Option<String>,

    /// Keep serving continuations until the runs finish
    #[arg(short, long)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
struct ContinueOutput {
    run_id: String,
    outcome: String,
}

fn describe(invocation: &Invocation) -> String {
    match invocation {
        Invocation::NoRun => "no such run".to_string(),
        Invocation::Stale => "stale continuation ignored".to_string(),
        Invocation::AlreadyTerminal(status) => format!("already {status}"),
        Invocation::Superseded => "superseded by another invocation".to_string(),
        Invocation::Suspended { stage } => format!("suspended during {stage}"),
        Invocation::Finished(status) => status.to_string(),
    }
}

/// Run the continue command.
pub async fn run(args: ContinueArgs, ctx: &Context) -> Result<()> {
    let mut runtime = ctx.runtime()?;

    let mut results: Vec<(RunId, Invocation)> = match &args.run_id {
        Some(raw) => {
            let run_id = parse_run_id(raw)?;
            let invocation = runtime.orchestrator.continue_run(&run_id, None).await?;
            vec![(run_id, invocation)]
        }
        None => runtime.orchestrator.continue_pending().await?,
    };

    if args.wait {
        for (run_id, invocation) in results.iter_mut() {
            if invocation.is_suspended() {
                let view = runtime.drive(run_id).await?;
                *invocation = Invocation::Finished(view.status);
            }
        }
    }

    if ctx.json_output {
        let output: Vec<ContinueOutput> = results
            .iter()
            .map(|(run_id, invocation)| ContinueOutput {
                run_id: run_id.to_string(),
                outcome: describe(invocation),
            })
            .collect();
        return print_json(&output);
    }

    let dim = Style::new().dim();
    if results.is_empty() {
        println!("{}", dim.apply_to("No pending runs"));
        return Ok(());
    }
    println!();
    println!("{}", style("Continued runs").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    for (run_id, invocation) in &results {
        println!("  {}  {}", run_id, describe(invocation));
    }
    if results.iter().any(|(_, i)| i.is_suspended()) {
        println!();
        println!("  {}", dim.apply_to("Suspended runs resume with: gleaner continue"));
    }
    println!();
    Ok(())
}
