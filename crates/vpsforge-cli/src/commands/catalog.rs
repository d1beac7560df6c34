//! `vpsf templates` / `vpsf plans`: What can be provisioned.

use vpsforge_common::config::ForgeConfig;
use vpsforge_runtime::Forge;

use crate::output;

/// Executes the `templates` command.
///
/// # Errors
///
/// Returns an error if the hypervisor cannot be queried.
pub async fn templates(forge: &Forge) -> anyhow::Result<()> {
    println!("{:<12} {:<8} {}", "NAME", "FAMILY", "VOLUME");
    for (name, template) in forge.configured_templates() {
        println!("{name:<12} {:<8} {}", template.family.to_string(), template.volume);
    }

    let available = forge.templates().await?;
    println!();
    println!("{:<70} {}", "ON NODE", "SIZE");
    for info in &available {
        let size = info
            .size_bytes
            .map_or_else(|| "-".to_string(), output::format_bytes);
        println!("{:<70} {size}", info.volume);
    }
    Ok(())
}

/// Executes the `plans` command.
pub fn plans(config: &ForgeConfig) {
    println!("{:<12} {:>8} {:>6} {:>8}", "PLAN", "MEMORY", "CORES", "DISK");
    for (name, plan) in &config.plans {
        println!(
            "{name:<12} {:>8} {:>6} {:>8}",
            output::format_mib(plan.memory_mb),
            plan.cpu_cores,
            format!("{} GiB", plan.disk_gb)
        );
    }
}
