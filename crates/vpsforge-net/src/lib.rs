//! # vpsforge-net
//!
//! Network address translation for guests. A forward is kept twice: as
//! data in a rule directory that survives reboots, and as live `iptables`
//! rules that do not. [`NatManager`] keeps the two in step.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod manager;
pub mod profile;
pub mod rule;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod sim;

pub use manager::NatManager;
pub use profile::BaselineProfile;
pub use rule::{FirewallRule, RuleOp};
pub use store::RuleStore;
