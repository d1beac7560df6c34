//! `vpsf create`: Provision a new container.

use clap::Args;
use vpsforge_common::types::OwnerId;
use vpsforge_runtime::{CreateRequest, Forge};

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container name, also used as hostname.
    #[arg(long)]
    pub name: String,

    /// Owning account.
    #[arg(long, env = "VPSF_OWNER")]
    pub owner: String,

    /// Resource plan.
    #[arg(long, default_value = "basic")]
    pub plan: String,

    /// OS template.
    #[arg(long, default_value = "debian")]
    pub template: String,
}

/// Executes the `create` command.
///
/// Prints the connection details, root password included, once the
/// container is reachable.
///
/// # Errors
///
/// Returns an error if validation, allocation, or a provisioning step
/// fails.
pub async fn execute(forge: &Forge, args: CreateArgs) -> anyhow::Result<()> {
    let record = forge
        .create(CreateRequest {
            name: args.name,
            owner: OwnerId::new(args.owner),
            plan: args.plan,
            template: args.template,
        })
        .await?;

    println!("Container {} ({}) is active.", record.name, record.id);
    println!("  private ip : {}", record.network.private_ip);
    println!("  ssh port   : {}", record.network.ssh_port);
    println!("  root pass  : {}", record.credential().expose());
    Ok(())
}
