//! `vpsf ps`: List containers.

use chrono::Utc;
use clap::Args;
use vpsforge_common::types::OwnerId;
use vpsforge_runtime::Forge;

use crate::output;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only containers of this account.
    #[arg(long, env = "VPSF_OWNER")]
    pub owner: Option<String>,

    /// Include deleted containers.
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the state store cannot be read.
pub async fn execute(forge: &Forge, args: PsArgs) -> anyhow::Result<()> {
    let records = match (&args.owner, args.all) {
        (Some(owner), false) => forge.list(&OwnerId::new(owner.as_str())).await?,
        (owner, _) => forge
            .list_all()
            .await?
            .into_iter()
            .filter(|r| args.all || r.holds_identifiers())
            .filter(|r| owner.as_ref().is_none_or(|o| r.owner.as_str() == o))
            .collect(),
    };

    if records.is_empty() {
        println!("No containers found.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{}", output::record_header());
    for record in &records {
        println!("{}", output::record_row(record, now));
    }
    Ok(())
}
