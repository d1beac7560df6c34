//! Structured command descriptions and the executor capability.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use vpsforge_common::constants::DEFAULT_COMMAND_TIMEOUT_SECS;
use vpsforge_common::error::{ForgeError, Result};

/// A host command: program, argument vector, and time budget.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    secret_args: BTreeSet<usize>,
    timeout: Duration,
}

impl CommandSpec {
    /// Starts a command for `program` with the default timeout.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secret_args: BTreeSet::new(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an argument that is masked in logs and [`fmt::Display`].
    #[must_use]
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        let _ = self.secret_args.insert(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Sets the time budget.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program to run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument vector, secrets included.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Time budget.
    #[must_use]
    pub const fn time_budget(&self) -> Duration {
        self.timeout
    }

    /// Returns whether any argument equals `needle`.
    #[must_use]
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for CommandSpec {
    /// Renders a shell-like line with secrets masked, for logs and
    /// diagnostics only. Never fed back to a shell.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&i) {
                f.write_str(" ***")?;
            } else if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"') {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("line", &self.to_string())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Output from a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command (`-1` when killed by a signal).
    pub exit_code: i32,
}

impl ExecOutput {
    /// A successful run printing `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    /// A failed run with the given code and diagnostic.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Whether the command exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into [`ForgeError::ExternalCallFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error naming `spec` when the exit code is non-zero.
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(ForgeError::external(
            spec.to_string(),
            format!("exit code {}: {detail}", self.exit_code),
        ))
    }
}

/// Capability to run host commands.
///
/// Implementations must honour [`CommandSpec::time_budget`] and return
/// [`ForgeError::Timeout`] when it is exceeded. A non-zero exit is *not*
/// an error at this layer; callers decide with [`ExecOutput::check`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs `spec` to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be spawned or the time
    /// budget is exceeded.
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput>;

    /// Runs `spec` and fails on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns an error if spawning fails, the budget is exceeded, or the
    /// command exits non-zero.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        self.run(spec).await?.check(spec)
    }
}
