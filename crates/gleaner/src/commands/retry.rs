//! Retry command - resume a failed run.

use anyhow::Result;
use clap::Args;

use super::{Context, parse_run_id, print_view};

/// Arguments for the retry command.
#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Run id
    pub run_id: String,

    /// Drive the run to completion in this process
    #[arg(short, long)]
    pub wait: bool,
}

/// Run the retry command.
pub async fn run(args: RetryArgs, ctx: &Context) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let mut runtime = ctx.runtime()?;
    let mut view = runtime.orchestrator.retry_run(&run_id).await?;
    if args.wait {
        view = runtime.drive(&run_id).await?;
    }
    print_view(&view, ctx)
}
