//! Provisioning pipeline.
//!
//! Steps run strictly in order over one task and the record is saved
//! after each one:
//!
//! | step              | on success            |
//! |-------------------|-----------------------|
//! | reserve           | `pending` saved       |
//! | precheck          |                       |
//! | create            | `created`             |
//! | baseline policy   |                       |
//! | bootstrap         | `configured`          |
//! | forward           | `active`              |
//!
//! The first failing step stops the pipeline and leaves the record in
//! `error` with the step and reason. Nothing is rolled back here; the
//! reclaimer releases failed records after a grace period.

use std::sync::Arc;

use chrono::Utc;
use rand::distr::{Alphanumeric, SampleString};
use vpsforge_common::config::{ForgeConfig, TemplateSpec};
use vpsforge_common::constants::CREDENTIAL_LENGTH;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::{
    ContainerRecord, ContainerStatus, Credential, OwnerId, PowerState, ProvisionStep,
};
use vpsforge_hypervisor::{CreateSpec, GuestCommand, Hypervisor, NetworkDescriptor};
use vpsforge_net::{BaselineProfile, NatManager};

use crate::allocator::{Allocator, Claim};
use crate::bootstrap;
use crate::state::StateStore;

/// A request for a new container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Display name, also the guest hostname.
    pub name: String,
    /// Requesting account.
    pub owner: OwnerId,
    /// Plan name.
    pub plan: String,
    /// Template name.
    pub template: String,
}

/// Generates a random alphanumeric root password.
#[must_use]
pub fn generate_credential() -> Credential {
    Credential::new(Alphanumeric.sample_string(&mut rand::rng(), CREDENTIAL_LENGTH))
}

/// Checks that `name` is a valid hostname label.
///
/// # Errors
///
/// Returns [`ForgeError::Validation`] otherwise.
pub fn validate_hostname(name: &str) -> Result<()> {
    let valid = (1..=63).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ForgeError::validation(format!(
            "invalid container name {name:?}: use 1-63 letters, digits, or inner hyphens"
        )))
    }
}

type StepResult = std::result::Result<(), (ProvisionStep, ForgeError)>;

fn at(step: ProvisionStep) -> impl FnOnce(ForgeError) -> (ProvisionStep, ForgeError) {
    move |err| (step, err)
}

/// Drives a request from reservation to an `active` record.
pub struct Provisioner {
    config: Arc<ForgeConfig>,
    store: Arc<dyn StateStore>,
    allocator: Allocator,
    hypervisor: Arc<dyn Hypervisor>,
    nat: Arc<NatManager>,
    profile: BaselineProfile,
}

impl Provisioner {
    /// Creates a pipeline over the given collaborators.
    #[must_use]
    pub fn new(
        config: Arc<ForgeConfig>,
        store: Arc<dyn StateStore>,
        hypervisor: Arc<dyn Hypervisor>,
        nat: Arc<NatManager>,
    ) -> Self {
        Self {
            allocator: Allocator::new(Arc::clone(&config), Arc::clone(&store)),
            profile: BaselineProfile::from_config(&config),
            config,
            store,
            hypervisor,
            nat,
        }
    }

    /// Runs the pipeline for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Validation`] before any side effect for an
    /// unknown plan or template or a bad name, the allocator's error if no
    /// identifiers are free, and [`ForgeError::Provisioning`] once a later
    /// step failed and the record was saved as `error`.
    pub async fn provision(&self, request: CreateRequest) -> Result<ContainerRecord> {
        let resources = self.config.plan(&request.plan)?;
        let template = self.config.template(&request.template)?.clone();
        validate_hostname(&request.name)?;
        if request.owner.as_str().trim().is_empty() {
            return Err(ForgeError::validation("owner must not be empty"));
        }

        let mut record = self
            .allocator
            .reserve(Claim {
                name: request.name,
                owner: request.owner,
                plan: request.plan,
                resources,
                template: request.template,
                credential: generate_credential(),
            })
            .await?;

        match self.run_steps(&mut record, &template).await {
            Ok(()) => {
                tracing::info!(
                    id = %record.id,
                    ip = %record.network.private_ip,
                    port = record.network.ssh_port,
                    "container active"
                );
                Ok(record)
            }
            Err((step, source)) => Err(self.record_failure(record, step, source).await),
        }
    }

    async fn record_failure(
        &self,
        mut record: ContainerRecord,
        step: ProvisionStep,
        source: ForgeError,
    ) -> ForgeError {
        tracing::error!(id = %record.id, step = %step, error = %source, "provisioning failed");
        let id = record.id;
        match record.fail(step, source.to_string(), Utc::now()) {
            Ok(()) => {
                if let Err(e) = self.store.save(&record).await {
                    tracing::error!(id = %id, error = %e, "failed record could not be saved");
                }
            }
            Err(e) => tracing::error!(id = %id, error = %e, "record could not enter error"),
        }
        ForgeError::Provisioning {
            id,
            step,
            source: Box::new(source),
        }
    }

    async fn run_steps(&self, record: &mut ContainerRecord, template: &TemplateSpec) -> StepResult {
        use ProvisionStep::{BaselinePolicy, Bootstrap, Create, Forward, Precheck};

        self.precheck(record).await.map_err(at(Precheck))?;

        self.create(record, template).await.map_err(at(Create))?;
        record.power = PowerState::Running;
        self.advance(record, ContainerStatus::Created)
            .await
            .map_err(at(Create))?;

        let profile = self.profile.apply(record.id).map_err(at(BaselinePolicy))?;
        tracing::debug!(id = %record.id, path = %profile.display(), "baseline policy applied");

        self.bootstrap(record, template).await.map_err(at(Bootstrap))?;
        self.advance(record, ContainerStatus::Configured)
            .await
            .map_err(at(Bootstrap))?;

        self.nat
            .assert_forward(&record.ssh_rule())
            .await
            .map_err(at(Forward))?;
        self.advance(record, ContainerStatus::Active)
            .await
            .map_err(at(Forward))
    }

    async fn advance(&self, record: &mut ContainerRecord, next: ContainerStatus) -> Result<()> {
        record.advance(next, Utc::now())?;
        self.store.save(record).await?;
        tracing::info!(id = %record.id, status = %next, "status advanced");
        Ok(())
    }

    /// Creation is not idempotent, so an id the hypervisor already knows
    /// is refused.
    async fn precheck(&self, record: &ContainerRecord) -> Result<()> {
        if self.hypervisor.exists(record.id).await? {
            return Err(ForgeError::external(
                "precheck",
                format!("instance {} already exists on the hypervisor", record.id),
            ));
        }
        Ok(())
    }

    async fn create(&self, record: &ContainerRecord, template: &TemplateSpec) -> Result<()> {
        let network = &self.config.network;
        let spec = CreateSpec {
            id: record.id,
            hostname: record.name.clone(),
            resources: record.resources,
            network: NetworkDescriptor {
                bridge: record.network.bridge.clone(),
                ip: record.network.private_ip,
                prefix_len: network.prefix_len,
                gateway: network.gateway,
                rate_mbps: network.rate_mbps,
            },
            template_volume: template.volume.clone(),
            os_family: template.family,
            root_credential: record.credential().clone(),
            storage: self.config.hypervisor.storage.clone(),
            swap_mb: self.config.hypervisor.swap_mb,
            start: true,
        };
        let descriptor = self.hypervisor.create(&spec).await?;
        tracing::info!(id = %descriptor.id, node = %descriptor.node, "instance created");
        Ok(())
    }

    async fn bootstrap(&self, record: &ContainerRecord, template: &TemplateSpec) -> Result<()> {
        let timeout = self.config.timeouts.bootstrap();
        for step in bootstrap::steps(template.family, &self.config.guest) {
            tracing::debug!(id = %record.id, step = step.name, "bootstrapping guest");
            let output = self
                .hypervisor
                .exec(record.id, &GuestCommand::sh(step.script, timeout))
                .await?;
            if !output.success() {
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                return Err(ForgeError::external(
                    format!("guest {}", step.name),
                    format!("exit code {}: {detail}", output.exit_code),
                ));
            }
        }
        Ok(())
    }
}
