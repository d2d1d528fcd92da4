//! Cancel command - stop a run.

use anyhow::Result;
use clap::Args;

use super::{Context, parse_run_id, print_view};

/// Arguments for the cancel command.
#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Run id
    pub run_id: String,
}

/// Run the cancel command.
pub async fn run(args: CancelArgs, ctx: &Context) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let runtime = ctx.runtime()?;
    let view = runtime.orchestrator.cancel_run(&run_id).await?;
    print_view(&view, ctx)
}
