//! Container orchestration for vpsforge.
//!
//! A create request flows through the [`allocator`] (id, address, port),
//! then the [`provisioner`] pipeline (hypervisor instance, baseline
//! firewall profile, guest bootstrap, SSH forward). The [`lifecycle`]
//! controller handles power changes and deletion, and the [`reclaim`]
//! sweep releases identifiers of records that failed long ago.
//! [`engine::Forge`] wires it all together.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod allocator;
pub mod bootstrap;
pub mod engine;
pub mod lifecycle;
pub mod notify;
pub mod provisioner;
pub mod reclaim;
pub mod state;
mod teardown;

pub use engine::Forge;
pub use lifecycle::DeleteRequest;
pub use provisioner::CreateRequest;
