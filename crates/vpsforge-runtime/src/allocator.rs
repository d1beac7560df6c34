//! Identifier allocation.
//!
//! The `next_*` functions are pure: they look at the values already taken
//! and pick a free one inside the configured bounds. [`Allocator`] runs
//! the scan and the insert of the new `pending` record inside one
//! [`StateStore::insert_with`], so two orchestrators sharing a state file
//! never hand out the same value.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use vpsforge_common::config::ForgeConfig;
use vpsforge_common::constants::PORT_DRAW_ATTEMPTS;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::{
    ContainerId, ContainerRecord, Credential, NetworkSpec, NewRecord, OwnerId, ResourceSpec,
};

use crate::state::StateStore;

/// Smallest value in `base..=max` not in `taken`.
fn first_free(taken: &BTreeSet<u32>, base: u32, max: u32) -> Option<u32> {
    let mut candidate = u64::from(base);
    for &value in taken.range(base..) {
        match u64::from(value).cmp(&candidate) {
            std::cmp::Ordering::Equal => candidate += 1,
            std::cmp::Ordering::Greater => break,
            std::cmp::Ordering::Less => {}
        }
    }
    u32::try_from(candidate).ok().filter(|&c| c <= max)
}

/// Smallest container id `>= base` not in `existing`.
///
/// # Errors
///
/// Returns [`ForgeError::AllocationExhausted`] if every id up to `max` is
/// taken.
pub fn next_container_id(existing: &BTreeSet<u32>, base: u32, max: u32) -> Result<ContainerId> {
    first_free(existing, base, max)
        .map(ContainerId::new)
        .ok_or(ForgeError::AllocationExhausted {
            resource: "container id",
            min: u64::from(base),
            max: u64::from(max),
        })
}

/// Smallest host offset `>= base` not in `existing`.
///
/// # Errors
///
/// Returns [`ForgeError::AllocationExhausted`] if every offset up to
/// `max` is taken.
pub fn next_private_ip_offset(existing: &BTreeSet<u32>, base: u32, max: u32) -> Result<u32> {
    first_free(existing, base, max).ok_or(ForgeError::AllocationExhausted {
        resource: "private ip",
        min: u64::from(base),
        max: u64::from(max),
    })
}

/// A port from `min..=max` that is not in `assigned`.
///
/// Draws at random first; once the draws keep colliding, scans the range
/// from a random start so a nearly full range still succeeds.
///
/// # Errors
///
/// Returns [`ForgeError::AllocationExhausted`] if every port is assigned.
pub fn next_ssh_port<R: Rng>(
    assigned: &BTreeSet<u16>,
    min: u16,
    max: u16,
    rng: &mut R,
) -> Result<u16> {
    let exhausted = ForgeError::AllocationExhausted {
        resource: "ssh port",
        min: u64::from(min),
        max: u64::from(max),
    };
    if min > max {
        return Err(exhausted);
    }
    for _ in 0..PORT_DRAW_ATTEMPTS {
        let port = rng.random_range(min..=max);
        if !assigned.contains(&port) {
            return Ok(port);
        }
    }
    let span = u32::from(max - min) + 1;
    let start = rng.random_range(0..span);
    (0..span)
        .map(|step| (start + step) % span)
        .filter_map(|offset| u16::try_from(u32::from(min) + offset).ok())
        .find(|port| !assigned.contains(port))
        .ok_or(exhausted)
}

/// Everything about a new record except its identifiers.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Display name and hostname.
    pub name: String,
    /// Owning account.
    pub owner: OwnerId,
    /// Plan name.
    pub plan: String,
    /// Plan quantities.
    pub resources: ResourceSpec,
    /// Template name.
    pub template: String,
    /// Generated root credential.
    pub credential: Credential,
}

/// Hands out ids, addresses, and ports.
pub struct Allocator {
    config: Arc<ForgeConfig>,
    store: Arc<dyn StateStore>,
}

impl Allocator {
    /// Creates an allocator reading taken values from `store`.
    #[must_use]
    pub fn new(config: Arc<ForgeConfig>, store: Arc<dyn StateStore>) -> Self {
        Self { config, store }
    }

    /// Picks free identifiers for `claim` and persists a `pending` record
    /// in the same store transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::AllocationExhausted`] when a pool is full, or
    /// a persistence error from the store.
    pub async fn reserve(&self, claim: Claim) -> Result<ContainerRecord> {
        let build = |live: &[ContainerRecord]| -> Result<ContainerRecord> {
            let (id, private_ip, ssh_port) = self.pick(live)?;
            Ok(ContainerRecord::pending(
                NewRecord {
                    id,
                    name: claim.name.clone(),
                    owner: claim.owner.clone(),
                    plan: claim.plan.clone(),
                    resources: claim.resources,
                    network: NetworkSpec {
                        bridge: self.config.network.bridge.clone(),
                        private_ip,
                        ssh_port,
                    },
                    template: claim.template.clone(),
                    credential: claim.credential.clone(),
                },
                Utc::now(),
            ))
        };
        let record = self.store.insert_with(&build).await?;
        tracing::info!(
            id = %record.id,
            ip = %record.network.private_ip,
            port = record.network.ssh_port,
            owner = %record.owner,
            "identifiers reserved"
        );
        Ok(record)
    }

    fn pick(&self, live: &[ContainerRecord]) -> Result<(ContainerId, Ipv4Addr, u16)> {
        let bounds = &self.config.allocation;
        let network = &self.config.network;
        let ids: BTreeSet<u32> = live.iter().map(|r| r.id.get()).collect();
        let offsets: BTreeSet<u32> = live
            .iter()
            .filter_map(|r| network.offset_of(r.network.private_ip))
            .collect();
        let ports: BTreeSet<u16> = live.iter().map(|r| r.network.ssh_port).collect();

        let id = next_container_id(&ids, bounds.id_base, bounds.id_max)?;
        let offset =
            next_private_ip_offset(&offsets, bounds.ip_offset_base, bounds.ip_offset_max)?;
        let port = next_ssh_port(
            &ports,
            bounds.ssh_port_min,
            bounds.ssh_port_max,
            &mut rand::rng(),
        )?;
        Ok((id, network.address_at(offset), port))
    }
}
