//! Sources command - show configured sources.

use anyhow::Result;
use clap::Args;
use console::{Style, style};
use serde::Serialize;

use super::{Context, print_json};

/// Arguments for the sources command.
#[derive(Args, Debug)]
pub struct SourcesArgs {}

#[derive(Debug, Serialize)]
struct SourceOutput {
    name: String,
    usable: bool,
    reason: Option<String>,
    default_target: u32,
}

/// Run the sources command.
pub async fn run(_args: SourcesArgs, ctx: &Context) -> Result<()> {
    let registry = ctx.collectors()?;
    let snapshot = registry.snapshot();

    let output: Vec<SourceOutput> = registry
        .source_infos()
        .into_iter()
        .map(|info| {
            let availability = snapshot.get(&info.name);
            SourceOutput {
                usable: availability.is_some_and(|a| a.usable),
                reason: availability.and_then(|a| a.reason.clone()),
                default_target: info.default_target,
                name: info.name,
            }
        })
        .collect();

    if ctx.json_output {
        return print_json(&output);
    }

    let dim = Style::new().dim();
    if output.is_empty() {
        println!("{}", dim.apply_to("No sources configured; add [[sources]] tables to gleaner.toml"));
        return Ok(());
    }

    println!();
    println!("{}", style("Sources").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    for source in &output {
        if source.usable {
            println!(
                "  {:<16} {} {}",
                source.name,
                Style::new().green().apply_to("● usable"),
                dim.apply_to(format!("(target {})", source.default_target))
            );
        } else {
            println!(
                "  {:<16} {} {}",
                source.name,
                Style::new().red().apply_to("● unusable"),
                dim.apply_to(source.reason.as_deref().unwrap_or(""))
            );
        }
    }
    println!();
    Ok(())
}
