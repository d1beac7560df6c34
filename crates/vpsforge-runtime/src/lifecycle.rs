//! Lifecycle Controller: power changes and deletion of provisioned
//! records.
//!
//! Every operation looks the record up and checks ownership before it
//! touches anything, so unknown ids and foreign records leave no trace.
//! Operations run under a lock shared with the reclaim sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use vpsforge_common::error::{ForgeError, Result, invalid_state};
use vpsforge_common::types::{ContainerId, ContainerRecord, ContainerStatus, OwnerId, PowerState};
use vpsforge_hypervisor::Hypervisor;

use crate::notify::{self, AuditEvent, AuditKind, Notifier};
use crate::state::{RecordFilter, StateStore};
use crate::teardown::Purger;

/// Serializes operations that change provisioned records.
pub(crate) type OpsLock = Arc<Mutex<()>>;

/// A confirmed request to delete a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    /// Container to delete.
    pub id: ContainerId,
    /// Requesting account.
    pub owner: OwnerId,
    /// Explicit confirmation from the requester.
    pub confirm: bool,
}

/// Start, stop, and delete.
pub struct LifecycleController {
    store: Arc<dyn StateStore>,
    hypervisor: Arc<dyn Hypervisor>,
    purger: Arc<Purger>,
    notifier: Arc<dyn Notifier>,
    ops: OpsLock,
}

impl LifecycleController {
    pub(crate) fn new(
        store: Arc<dyn StateStore>,
        hypervisor: Arc<dyn Hypervisor>,
        purger: Arc<Purger>,
        notifier: Arc<dyn Notifier>,
        ops: OpsLock,
    ) -> Self {
        Self {
            store,
            hypervisor,
            purger,
            notifier,
            ops,
        }
    }

    async fn owned(&self, id: ContainerId, owner: &OwnerId) -> Result<ContainerRecord> {
        let record = self
            .store
            .find_one(&RecordFilter::by_id(id))
            .await?
            .ok_or_else(|| ForgeError::NotFound {
                kind: "container",
                id: id.to_string(),
            })?;
        if !record.is_owned_by(owner) {
            tracing::warn!(id = %id, owner = %owner, "request for a foreign container refused");
            return Err(ForgeError::unauthorized(format!(
                "container {id} is not owned by {owner}"
            )));
        }
        Ok(record)
    }

    /// Starts a stopped, active container.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::NotFound`], [`ForgeError::Authorization`], or
    /// [`ForgeError::InvalidState`] without side effects, or the
    /// hypervisor's error if the start fails.
    pub async fn start(&self, id: ContainerId, owner: &OwnerId) -> Result<ContainerRecord> {
        self.set_power(id, owner, PowerState::Running).await
    }

    /// Stops a running, active container.
    ///
    /// # Errors
    ///
    /// Same as [`LifecycleController::start`].
    pub async fn stop(&self, id: ContainerId, owner: &OwnerId) -> Result<ContainerRecord> {
        self.set_power(id, owner, PowerState::Stopped).await
    }

    async fn set_power(
        &self,
        id: ContainerId,
        owner: &OwnerId,
        target: PowerState,
    ) -> Result<ContainerRecord> {
        let _ops = self.ops.lock().await;
        let mut record = self.owned(id, owner).await?;
        let operation = match target {
            PowerState::Running => "start",
            PowerState::Stopped => "stop",
        };
        if record.status() != ContainerStatus::Active {
            return Err(invalid_state(id, record.status(), operation));
        }
        if record.power == target {
            return Err(ForgeError::InvalidState {
                id,
                status: record.power.to_string(),
                operation,
            });
        }

        match target {
            PowerState::Running => self.hypervisor.start(id).await?,
            PowerState::Stopped => self.hypervisor.stop(id).await?,
        }
        record.power = target;
        record.updated_at = Utc::now();
        self.store.save(&record).await?;
        tracing::info!(id = %id, power = %target, "power state changed");
        Ok(record)
    }

    /// Deletes a container: revokes its forward, destroys the instance,
    /// and marks the record `deleted`, releasing its id, address, and
    /// port.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::NotFound`] or [`ForgeError::Authorization`]
    /// (also for a missing confirmation) without side effects,
    /// [`ForgeError::InvalidState`] while the record is still being
    /// provisioned, or the purge error after the record was saved as
    /// `error` with a teardown failure.
    pub async fn delete(&self, request: &DeleteRequest) -> Result<ContainerRecord> {
        let _ops = self.ops.lock().await;
        let mut record = self.owned(request.id, &request.owner).await?;
        if !request.confirm {
            return Err(ForgeError::unauthorized(format!(
                "deleting container {} requires confirmation",
                request.id
            )));
        }
        if !matches!(
            record.status(),
            ContainerStatus::Active | ContainerStatus::Error
        ) {
            return Err(invalid_state(request.id, record.status(), "delete"));
        }

        if let Err(e) = self.purger.purge(&record).await {
            tracing::error!(id = %record.id, error = %e, "teardown failed");
            record.fail_teardown(e.to_string(), Utc::now())?;
            self.store.save(&record).await?;
            return Err(e);
        }

        let now = Utc::now();
        record.mark_deleted(now)?;
        self.store.save(&record).await?;
        tracing::info!(id = %record.id, owner = %record.owner, "container deleted");

        notify::deliver(
            self.notifier.as_ref(),
            &AuditEvent::new(AuditKind::Deleted, &record, now),
        )
        .await;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use vpsforge_common::config::ForgeConfig;
    use vpsforge_common::types::ProvisionStep;
    use vpsforge_hypervisor::InstanceStatus;
    use vpsforge_hypervisor::fake::{FakeHypervisor, FakeOp, HypervisorCall};
    use vpsforge_net::sim::IptablesSimulator;
    use vpsforge_net::{BaselineProfile, NatManager};

    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use crate::state::MemoryStateStore;
    use crate::state::tests::{activate, record};

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryStateStore>,
        hv: FakeHypervisor,
        sim: IptablesSimulator,
        nat: Arc<NatManager>,
        profile: BaselineProfile,
        notifier: Arc<RecordingNotifier>,
        controller: LifecycleController,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ForgeConfig::default();
        config.firewall.rules_dir = tmp.path().join("nat");
        config.firewall.profile_dir = tmp.path().join("firewall");
        std::fs::create_dir_all(&config.firewall.profile_dir).unwrap();
        std::fs::write(config.firewall.profile_dir.join("baseline.fw"), "[OPTIONS]\n").unwrap();

        let store = Arc::new(MemoryStateStore::new());
        let hv = FakeHypervisor::new();
        let sim = IptablesSimulator::new();
        let nat = Arc::new(NatManager::from_config(&config, Arc::new(sim.clone())));
        let profile = BaselineProfile::from_config(&config);
        let notifier = Arc::new(RecordingNotifier::default());
        let purger = Arc::new(Purger {
            hypervisor: Arc::new(hv.clone()),
            nat: Arc::clone(&nat),
            profile: profile.clone(),
        });
        let controller = LifecycleController::new(
            store.clone(),
            Arc::new(hv.clone()),
            purger,
            notifier.clone(),
            OpsLock::default(),
        );
        Harness {
            _tmp: tmp,
            store,
            hv,
            sim,
            nat,
            profile,
            notifier,
            controller,
        }
    }

    /// Stores an active record backed by a running instance, a profile,
    /// and a live forward.
    async fn provisioned(h: &Harness, id: u32, owner: &str) -> ContainerRecord {
        let mut rec = record(id, owner, 3, 2100);
        activate(&mut rec);
        rec.power = PowerState::Running;
        h.hv.add_foreign_instance(rec.id);
        let _ = h.profile.apply(rec.id).unwrap();
        h.nat.assert_forward(&rec.ssh_rule()).await.unwrap();
        h.store.save(&rec).await.unwrap();
        rec
    }

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    #[tokio::test]
    async fn stop_then_start_round_trips_power() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;

        let stopped = h.controller.stop(rec.id, &alice()).await.unwrap();
        assert_eq!(stopped.power, PowerState::Stopped);
        assert_eq!(h.hv.instance(rec.id), InstanceStatus::Stopped);

        let started = h.controller.start(rec.id, &alice()).await.unwrap();
        assert_eq!(started.power, PowerState::Running);
        assert_eq!(h.hv.instance(rec.id), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn power_change_to_current_state_is_invalid() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;
        let err = h.controller.start(rec.id, &alice()).await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidState { operation: "start", .. }));
        assert!(!h.hv.calls().contains(&HypervisorCall::Start(rec.id)));
    }

    #[tokio::test]
    async fn power_change_requires_active_record() {
        let h = harness();
        let rec = record(100, "alice", 3, 2100);
        h.store.save(&rec).await.unwrap();
        let err = h.controller.stop(rec.id, &alice()).await.unwrap_err();
        assert!(matches!(err, ForgeError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn foreign_owner_is_refused_without_mutation() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;
        let before = h.hv.calls().len();

        let err = h.controller.stop(rec.id, &OwnerId::new("mallory")).await.unwrap_err();
        assert!(matches!(err, ForgeError::Authorization { .. }));
        let err = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: OwnerId::new("mallory"),
                confirm: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Authorization { .. }));

        assert_eq!(h.hv.calls().len(), before);
        let stored = h.store.find_one(&RecordFilter::by_id(rec.id)).await.unwrap().unwrap();
        assert_eq!(stored, rec);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let h = harness();
        let err = h
            .controller
            .delete(&DeleteRequest {
                id: ContainerId::new(4242),
                owner: alice(),
                confirm: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotFound { .. }));
        assert!(h.store.find(&RecordFilter::all()).await.unwrap().is_empty());
        assert!(h.hv.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_confirmation() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;
        let err = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: alice(),
                confirm: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Authorization { .. }));
        assert_eq!(h.hv.instance(rec.id), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn delete_purges_and_releases_identifiers() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;

        let deleted = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: alice(),
                confirm: true,
            })
            .await
            .unwrap();

        assert_eq!(deleted.status(), ContainerStatus::Deleted);
        assert!(deleted.expiry.is_some());
        assert!(!deleted.holds_identifiers());
        assert_eq!(h.hv.instance(rec.id), InstanceStatus::Missing);
        let calls = h.hv.calls();
        let stop = calls.iter().position(|c| *c == HypervisorCall::Stop(rec.id));
        let destroy = calls.iter().position(|c| *c == HypervisorCall::Destroy(rec.id));
        assert!(stop.unwrap() < destroy.unwrap());
        assert_eq!(h.sim.live_count(), 0);
        assert!(h.nat.forwards().unwrap().is_empty());
        assert!(!h.profile.is_applied(rec.id));
        assert!(h.store.find(&RecordFilter::live()).await.unwrap().is_empty());

        let events = h.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::Deleted);
    }

    #[tokio::test]
    async fn failed_destroy_leaves_teardown_error() {
        let h = harness();
        let rec = provisioned(&h, 100, "alice").await;
        h.hv.fail(FakeOp::Destroy, "volume busy");

        let err = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: alice(),
                confirm: true,
            })
            .await
            .unwrap_err();
        assert!(err.is_external());

        let stored = h.store.find_one(&RecordFilter::by_id(rec.id)).await.unwrap().unwrap();
        assert_eq!(stored.status(), ContainerStatus::Error);
        assert_eq!(stored.failure.unwrap().step, ProvisionStep::Teardown);
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn deleting_error_record_spares_foreign_instance() {
        let h = harness();
        let mut rec = record(100, "alice", 3, 2100);
        rec.fail(ProvisionStep::Precheck, "already exists", Utc::now()).unwrap();
        h.store.save(&rec).await.unwrap();
        h.hv.add_foreign_instance(rec.id);

        let deleted = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: alice(),
                confirm: true,
            })
            .await
            .unwrap();
        assert_eq!(deleted.status(), ContainerStatus::Deleted);
        assert_eq!(h.hv.instance(rec.id), InstanceStatus::Running);
        assert!(!h.hv.calls().contains(&HypervisorCall::Destroy(rec.id)));
    }

    #[tokio::test]
    async fn pending_record_cannot_be_deleted() {
        let h = harness();
        let rec = record(100, "alice", 3, 2100);
        h.store.save(&rec).await.unwrap();
        let err = h
            .controller
            .delete(&DeleteRequest {
                id: rec.id,
                owner: alice(),
                confirm: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::InvalidState { operation: "delete", .. }));
    }
}
