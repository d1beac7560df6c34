//! `vpsf start` / `vpsf stop`: Change a container's power state.

use clap::Args;
use vpsforge_common::types::{ContainerId, OwnerId};
use vpsforge_runtime::Forge;

/// Arguments for the `start` and `stop` commands.
#[derive(Args, Debug)]
pub struct PowerArgs {
    /// Container id.
    pub id: u32,

    /// Owning account.
    #[arg(long, env = "VPSF_OWNER")]
    pub owner: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container is unknown, foreign, not stopped,
/// or the hypervisor refuses.
pub async fn start(forge: &Forge, args: PowerArgs) -> anyhow::Result<()> {
    let record = forge
        .start(ContainerId::new(args.id), &OwnerId::new(args.owner))
        .await?;
    println!("Container {} started.", record.id);
    Ok(())
}

/// Executes the `stop` command.
///
/// # Errors
///
/// Returns an error if the container is unknown, foreign, not running,
/// or the hypervisor refuses.
pub async fn stop(forge: &Forge, args: PowerArgs) -> anyhow::Result<()> {
    let record = forge
        .stop(ContainerId::new(args.id), &OwnerId::new(args.owner))
        .await?;
    println!("Container {} stopped.", record.id);
    Ok(())
}
