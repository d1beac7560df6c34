//! Formatted output helpers for CLI commands.
//!
//! Provides the container table and human-readable sizes and ages.

use chrono::{DateTime, Utc};
use vpsforge_common::types::ContainerRecord;

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Formats a plan's memory given in MiB.
#[must_use]
pub fn format_mib(mib: u32) -> String {
    if mib >= 1024 && mib % 1024 == 0 {
        format!("{} GiB", mib / 1024)
    } else {
        format!("{mib} MiB")
    }
}

/// Formats the time elapsed since `since` (e.g., "3h", "2d").
#[must_use]
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(since);
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{}m", age.num_minutes())
    } else {
        format!("{}s", age.num_seconds().max(0))
    }
}

/// Header line of the container table.
#[must_use]
pub fn record_header() -> String {
    format!(
        "{:<8} {:<16} {:<12} {:<11} {:<8} {:<15} {:<6} {:<5} NOTE",
        "ID", "NAME", "OWNER", "STATUS", "POWER", "PRIVATE IP", "PORT", "AGE"
    )
}

/// One row of the container table.
#[must_use]
pub fn record_row(record: &ContainerRecord, now: DateTime<Utc>) -> String {
    let note = record
        .failure
        .as_ref()
        .map_or_else(String::new, |f| format!("{}: {}", f.step, f.reason));
    format!(
        "{:<8} {:<16} {:<12} {:<11} {:<8} {:<15} {:<6} {:<5} {note}",
        record.id.to_string(),
        record.name,
        record.owner.as_str(),
        record.status().to_string(),
        record.power.to_string(),
        record.network.private_ip.to_string(),
        record.network.ssh_port,
        format_age(record.created_at, now),
    )
}
