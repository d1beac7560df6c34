//! The orchestrator facade.
//!
//! [`Forge`] wires every component from one immutable configuration value
//! and exposes the operations the CLI calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use vpsforge_common::config::{ForgeConfig, TemplateSpec};
use vpsforge_common::error::Result;
use vpsforge_common::types::{ContainerId, ContainerRecord, OwnerId, ResourceSpec};
use vpsforge_exec::{CommandExecutor, ShellExecutor};
use vpsforge_hypervisor::{self as hypervisor, Hypervisor, TemplateInfo};
use vpsforge_net::{BaselineProfile, NatManager};

use crate::lifecycle::{DeleteRequest, LifecycleController, OpsLock};
use crate::notify::{self, Notifier};
use crate::provisioner::{CreateRequest, Provisioner};
use crate::reclaim::{ReclaimReport, Reclaimer};
use crate::state::{JsonStateStore, RecordFilter, StateStore};
use crate::teardown::Purger;

/// Everything a running orchestrator needs.
pub struct Forge {
    config: Arc<ForgeConfig>,
    store: Arc<dyn StateStore>,
    hypervisor: Arc<dyn Hypervisor>,
    nat: Arc<NatManager>,
    provisioner: Provisioner,
    lifecycle: LifecycleController,
    reclaimer: Reclaimer,
}

impl Forge {
    /// Opens the orchestrator against the real host: `pct`/`iptables`
    /// through the shell, records in the JSON state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor backend or the notification
    /// sink cannot be built.
    pub fn open(config: Arc<ForgeConfig>) -> Result<Self> {
        let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor::new());
        let hypervisor = hypervisor::connect(&config, Arc::clone(&executor))?;
        let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::new(&config.state_file));
        let nat = Arc::new(NatManager::from_config(&config, executor));
        let notifier = notify::from_config(&config)?;
        tracing::debug!(state = %config.state_file.display(), "orchestrator opened");
        Self::with_parts(config, store, hypervisor, nat, notifier)
    }

    /// Assembles the orchestrator from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the reclaim grace period is out of range.
    pub fn with_parts(
        config: Arc<ForgeConfig>,
        store: Arc<dyn StateStore>,
        hypervisor: Arc<dyn Hypervisor>,
        nat: Arc<NatManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let purger = Arc::new(Purger {
            hypervisor: Arc::clone(&hypervisor),
            nat: Arc::clone(&nat),
            profile: BaselineProfile::from_config(&config),
        });
        let ops = OpsLock::default();
        Ok(Self {
            provisioner: Provisioner::new(
                Arc::clone(&config),
                Arc::clone(&store),
                Arc::clone(&hypervisor),
                Arc::clone(&nat),
            ),
            lifecycle: LifecycleController::new(
                Arc::clone(&store),
                Arc::clone(&hypervisor),
                Arc::clone(&purger),
                Arc::clone(&notifier),
                Arc::clone(&ops),
            ),
            reclaimer: Reclaimer::new(
                Arc::clone(&store),
                purger,
                notifier,
                ops,
                config.reclaim_grace(),
            )?,
            config,
            store,
            hypervisor,
            nat,
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Provisions a new container.
    ///
    /// # Errors
    ///
    /// See [`Provisioner::provision`].
    pub async fn create(&self, request: CreateRequest) -> Result<ContainerRecord> {
        self.provisioner.provision(request).await
    }

    /// Starts a container.
    ///
    /// # Errors
    ///
    /// See [`LifecycleController::start`].
    pub async fn start(&self, id: ContainerId, owner: &OwnerId) -> Result<ContainerRecord> {
        self.lifecycle.start(id, owner).await
    }

    /// Stops a container.
    ///
    /// # Errors
    ///
    /// See [`LifecycleController::stop`].
    pub async fn stop(&self, id: ContainerId, owner: &OwnerId) -> Result<ContainerRecord> {
        self.lifecycle.stop(id, owner).await
    }

    /// Deletes a container.
    ///
    /// # Errors
    ///
    /// See [`LifecycleController::delete`].
    pub async fn delete(&self, request: &DeleteRequest) -> Result<ContainerRecord> {
        self.lifecycle.delete(request).await
    }

    /// Non-deleted records of `owner`, by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list(&self, owner: &OwnerId) -> Result<Vec<ContainerRecord>> {
        let mut records = self
            .store
            .find(&RecordFilter::owned_by(owner.clone()))
            .await?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Every record, deleted ones included, by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list_all(&self) -> Result<Vec<ContainerRecord>> {
        let mut records = self.store.find(&RecordFilter::all()).await?;
        records.sort_by_key(|r| (r.id, r.created_at));
        Ok(records)
    }

    /// Reapplies the persisted forwards to the live firewall.
    ///
    /// # Errors
    ///
    /// See [`NatManager::reconcile`].
    pub async fn reconcile(&self) -> Result<usize> {
        self.nat.reconcile().await
    }

    /// Removes every persisted forward from the live firewall.
    ///
    /// # Errors
    ///
    /// See [`NatManager::teardown`].
    pub async fn teardown_firewall(&self) -> Result<usize> {
        self.nat.teardown().await
    }

    /// Reclaims failed records older than the grace period.
    ///
    /// # Errors
    ///
    /// See [`Reclaimer::sweep`].
    pub async fn reclaim(&self, now: DateTime<Utc>) -> Result<ReclaimReport> {
        self.reclaimer.sweep(now).await
    }

    /// Template archives on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor cannot be queried.
    pub async fn templates(&self) -> Result<Vec<TemplateInfo>> {
        self.hypervisor.list_templates().await
    }

    /// Configured templates by name.
    pub fn configured_templates(&self) -> impl Iterator<Item = (&str, &TemplateSpec)> {
        self.config.templates.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Configured plans by name.
    pub fn plans(&self) -> impl Iterator<Item = (&str, ResourceSpec)> {
        self.config.plans.iter().map(|(n, p)| (n.as_str(), *p))
    }
}
