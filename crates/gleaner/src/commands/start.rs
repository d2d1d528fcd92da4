//! Start command - begin a collection run.

use anyhow::{Result, bail};
use clap::Args;
use console::{Style, style};
use gleaner_types::{RunOptions, RunStatus};
use serde::Serialize;

use super::{Context, print_json, print_view, status_style};

/// Arguments for the start and run commands.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// What to collect, in plain words
    pub instruction: String,

    /// Target count for one source (SOURCE=N), repeatable
    #[arg(short, long = "target", value_name = "SOURCE=N", value_parser = parse_target)]
    pub targets: Vec<(String, u32)>,

    /// Append to an existing output sink instead of creating one
    #[arg(long)]
    pub sink_id: Option<String>,

    /// Your own identifier for the run
    #[arg(long)]
    pub external_id: Option<String>,

    /// Drive the run to completion in this process
    #[arg(short, long)]
    pub wait: bool,
}

impl StartArgs {
    /// Same arguments, always waiting.
    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }
}

fn parse_target(raw: &str) -> std::result::Result<(String, u32), String> {
    let (source, count) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SOURCE=N, got '{raw}'"))?;
    let source = source.trim();
    if source.is_empty() {
        return Err(format!("missing source name in '{raw}'"));
    }
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("'{count}' is not a count"))?;
    Ok((source.to_string(), count))
}

#[derive(Debug, Serialize)]
struct StartOutput {
    run_id: String,
    status: RunStatus,
    output_location: Option<String>,
    last_error: Option<String>,
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let mut runtime = ctx.runtime()?;
    let options = RunOptions {
        external_id: args.external_id,
        output_sink: args.sink_id,
        target_overrides: args.targets.into_iter().collect(),
    };

    let started = runtime
        .orchestrator
        .start_run(&args.instruction, options)
        .await?;

    if args.wait && started.last_error.is_none() {
        let view = runtime.drive(&started.run_id).await?;
        print_view(&view, ctx)?;
        if view.status == RunStatus::Failed {
            bail!(
                "run {} failed: {}",
                view.run_id,
                view.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        return Ok(());
    }

    if ctx.json_output {
        return print_json(&StartOutput {
            run_id: started.run_id.to_string(),
            status: started.status,
            output_location: started.output_location,
            last_error: started.last_error,
        });
    }

    let dim = Style::new().dim();
    println!();
    println!("{} {}", style("Started run").bold(), started.run_id);
    println!(
        "  {} {}",
        dim.apply_to("Status:"),
        status_style(&started.status).apply_to(format!("● {}", started.status))
    );
    if let Some(location) = &started.output_location {
        println!("  {} {}", dim.apply_to("Output:"), location);
    }
    if let Some(error) = &started.last_error {
        println!("  {} {}", dim.apply_to("Error:"), Style::new().red().apply_to(error));
    } else {
        println!();
        println!("  {}", dim.apply_to("Collect with: gleaner continue"));
    }
    println!();
    Ok(())
}
