//! Status command - show one run.

use anyhow::Result;
use clap::Args;

use super::{Context, parse_run_id, print_view};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Run id
    pub run_id: String,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let run_id = parse_run_id(&args.run_id)?;
    let runtime = ctx.runtime()?;
    let view = runtime.orchestrator.get_run_status(&run_id)?;
    print_view(&view, ctx)
}
