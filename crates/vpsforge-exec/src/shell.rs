//! Executor spawning real host processes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use vpsforge_common::error::{ForgeError, Result};

use crate::command::{CommandExecutor, CommandSpec, ExecOutput};

/// Runs commands as child processes of the daemon.
///
/// The child is killed when its time budget runs out, so a wedged
/// `pct exec` cannot pin a task forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl ShellExecutor {
    /// Creates a new shell executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        tracing::debug!(command = %spec, "running host command");

        let child = Command::new(spec.program())
            .args(spec.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ForgeError::external(
                    spec.to_string(),
                    format!("cannot spawn {}: {e}", spec.program()),
                )
            })?;

        let output = tokio::time::timeout(spec.time_budget(), child.wait_with_output())
            .await
            .map_err(|_| ForgeError::Timeout {
                operation: spec.to_string(),
                after: spec.time_budget(),
            })?
            .map_err(|e| ForgeError::external(spec.to_string(), e.to_string()))?;

        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        tracing::debug!(command = %spec, exit_code = result.exit_code, "host command finished");
        Ok(result)
    }
}
