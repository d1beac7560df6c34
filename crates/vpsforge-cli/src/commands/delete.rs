//! `vpsf delete`: Delete a container.

use clap::Args;
use vpsforge_common::types::{ContainerId, OwnerId};
use vpsforge_runtime::{DeleteRequest, Forge};

/// Arguments for the `delete` command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Container id.
    pub id: u32,

    /// Owning account.
    #[arg(long, env = "VPSF_OWNER")]
    pub owner: String,

    /// Confirm the deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Executes the `delete` command.
///
/// # Errors
///
/// Returns an error if the container is unknown or foreign, the request
/// is unconfirmed, or the teardown fails.
pub async fn execute(forge: &Forge, args: DeleteArgs) -> anyhow::Result<()> {
    let record = forge
        .delete(&DeleteRequest {
            id: ContainerId::new(args.id),
            owner: OwnerId::new(args.owner),
            confirm: args.yes,
        })
        .await?;
    println!(
        "Container {} deleted; port {} released.",
        record.id, record.network.ssh_port
    );
    Ok(())
}
