//! `vpsf reconcile` / `vpsf teardown`: Host firewall maintenance.
//!
//! Meant for the interface `post-up` / `pre-down` hooks.

use vpsforge_runtime::Forge;

/// Executes the `reconcile` command.
///
/// # Errors
///
/// Returns an error if the rule store cannot be read or `iptables` fails.
pub async fn reconcile(forge: &Forge) -> anyhow::Result<()> {
    let applied = forge.reconcile().await?;
    println!("{applied} firewall rules applied.");
    Ok(())
}

/// Executes the `teardown` command.
///
/// # Errors
///
/// Returns an error if the rule store cannot be read or `iptables` fails.
pub async fn teardown(forge: &Forge) -> anyhow::Result<()> {
    let removed = forge.teardown_firewall().await?;
    println!("{removed} firewall rules removed.");
    Ok(())
}
