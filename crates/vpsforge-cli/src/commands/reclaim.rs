//! `vpsf reclaim`: Release identifiers of failed containers.

use chrono::Utc;
use clap::Args;
use vpsforge_runtime::Forge;

/// Arguments for the `reclaim` command.
#[derive(Args, Debug)]
pub struct ReclaimArgs {
    /// Print what was reclaimed, one id per line.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Executes the `reclaim` command.
///
/// # Errors
///
/// Returns an error if the state store cannot be read.
pub async fn execute(forge: &Forge, args: ReclaimArgs) -> anyhow::Result<()> {
    let report = forge.reclaim(Utc::now()).await?;
    println!(
        "{} reclaimed, {} skipped, {} within grace period.",
        report.reclaimed.len(),
        report.skipped.len(),
        report.waiting
    );
    if args.verbose {
        for id in &report.reclaimed {
            println!("reclaimed {id}");
        }
        for id in &report.skipped {
            println!("skipped   {id}");
        }
    }
    Ok(())
}
