//! CLI command definitions and dispatch.

pub mod catalog;
pub mod create;
pub mod delete;
pub mod firewall;
pub mod power;
pub mod ps;
pub mod reclaim;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vpsforge_common::config::ForgeConfig;
use vpsforge_common::constants::DEFAULT_CONFIG_FILE;
use vpsforge_runtime::Forge;

/// vpsforge: container provisioning for a single hypervisor node.
#[derive(Parser, Debug)]
#[command(name = "vpsf", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the YAML configuration file.
    #[arg(long, global = true, env = "VPSF_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision a new container.
    Create(create::CreateArgs),
    /// Start a stopped container.
    Start(power::PowerArgs),
    /// Stop a running container.
    Stop(power::PowerArgs),
    /// Delete a container and release its identifiers.
    Delete(delete::DeleteArgs),
    /// List containers.
    Ps(ps::PsArgs),
    /// Reapply persisted port forwards to the live firewall.
    Reconcile,
    /// Remove persisted port forwards from the live firewall.
    Teardown,
    /// Release identifiers of containers that failed long ago.
    Reclaim(reclaim::ReclaimArgs),
    /// List template archives on the node and configured templates.
    Templates,
    /// List configured plans.
    Plans,
}

/// Loads the configuration, falling back to defaults when the default
/// file does not exist.
fn load_config(path: &Path) -> anyhow::Result<ForgeConfig> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG_FILE) {
        tracing::info!(path = %path.display(), "no configuration file, using defaults");
        return Ok(ForgeConfig::default());
    }
    ForgeConfig::load(path)
        .with_context(|| format!("cannot load configuration {}", path.display()))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(load_config(&cli.config)?);
    let forge = Forge::open(config).context("cannot open orchestrator")?;
    match cli.command {
        Command::Create(args) => create::execute(&forge, args).await,
        Command::Start(args) => power::start(&forge, args).await,
        Command::Stop(args) => power::stop(&forge, args).await,
        Command::Delete(args) => delete::execute(&forge, args).await,
        Command::Ps(args) => ps::execute(&forge, args).await,
        Command::Reconcile => firewall::reconcile(&forge).await,
        Command::Teardown => firewall::teardown(&forge).await,
        Command::Reclaim(args) => reclaim::execute(&forge, args).await,
        Command::Templates => catalog::templates(&forge).await,
        Command::Plans => {
            catalog::plans(forge.config());
            Ok(())
        }
    }
}
