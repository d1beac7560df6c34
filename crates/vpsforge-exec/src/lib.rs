//! Host command execution for vpsforge.
//!
//! Every shell-out the orchestrator performs goes through the
//! [`CommandExecutor`] trait. Commands are structured data
//! ([`CommandSpec`]): a program plus an argument vector, never a string
//! assembled for a shell. Tests swap in the recording fake from the
//! `test-util` feature to assert exact invocations.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod command;
pub mod shell;

#[cfg(any(test, feature = "test-util"))]
pub mod recording;

pub use command::{CommandExecutor, CommandSpec, ExecOutput};
pub use shell::ShellExecutor;
