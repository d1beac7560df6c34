//! Removal of everything a record holds outside the store.

use std::sync::Arc;

use vpsforge_common::error::Result;
use vpsforge_common::types::ContainerRecord;
use vpsforge_hypervisor::{Hypervisor, InstanceStatus};
use vpsforge_net::{BaselineProfile, NatManager};

/// Revokes the forward, stops and destroys the instance, and drops the
/// guest firewall profile. Each part is skipped when already gone.
pub(crate) struct Purger {
    pub(crate) hypervisor: Arc<dyn Hypervisor>,
    pub(crate) nat: Arc<NatManager>,
    pub(crate) profile: BaselineProfile,
}

impl Purger {
    /// Purges `record`. An instance that never belonged to the record is
    /// left alone.
    pub(crate) async fn purge(&self, record: &ContainerRecord) -> Result<()> {
        let id = record.id;
        if let Some(forward) = self.nat.revoke_forward(record.network.ssh_port).await? {
            tracing::debug!(id = %id, forward = %forward, "forward revoked");
        }
        if !record.owns_instance() {
            tracing::info!(id = %id, "instance was never created by this record, leaving it");
            return Ok(());
        }
        match self.hypervisor.status(id).await? {
            InstanceStatus::Missing => {
                tracing::debug!(id = %id, "instance already gone");
            }
            status => {
                if status == InstanceStatus::Running {
                    self.hypervisor.stop(id).await?;
                }
                self.hypervisor.destroy(id).await?;
                tracing::info!(id = %id, "instance destroyed");
            }
        }
        if let Err(e) = self.profile.remove(id) {
            tracing::warn!(id = %id, error = %e, "guest firewall profile not removed");
        }
        Ok(())
    }
}
