//! Domain primitive types used across the vpsforge workspace.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ForgeError, Result, invalid_state};

/// Numeric identifier addressing an instance on the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(u32);

impl ContainerId {
    /// Wraps a raw hypervisor id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw numeric id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContainerId {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| ForgeError::validation(format!("invalid container id: {s}")))
    }
}

/// Identifier of the account owning a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Creates an owner id from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root password generated for a new guest.
///
/// Never printed through `Debug`; call [`Credential::expose`] where the
/// clear text is genuinely needed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wraps an already generated secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the clear-text secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Resource quantities of a plan, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// Root disk size in GiB.
    pub disk_gb: u32,
}

/// Guest network identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Host bridge the guest NIC is attached to.
    pub bridge: String,
    /// Private address inside the guest subnet.
    pub private_ip: Ipv4Addr,
    /// Host port forwarded to the guest SSH daemon.
    pub ssh_port: u16,
}

/// Operating system family of a template. Decides how the guest is
/// bootstrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Alpine Linux: `apk`, `OpenRC`, busybox `ash`.
    Alpine,
    /// Debian: `apt`, `systemd`, `bash`.
    Debian,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alpine => write!(f, "alpine"),
            Self::Debian => write!(f, "debian"),
        }
    }
}

/// A DNAT forwarding rule exposing a guest port on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatRule {
    /// Host port receiving the traffic.
    pub external_port: u16,
    /// Guest address traffic is redirected to.
    pub internal_ip: Ipv4Addr,
    /// Guest port traffic is redirected to.
    pub internal_port: u16,
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.external_port, self.internal_ip, self.internal_port
        )
    }
}

/// Provisioning status of a container record.
///
/// Moves forward only: `pending → created → configured → active`, any
/// non-terminal state may fall to `error`, and `active` or `error` records
/// end in `deleted`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Identifiers reserved, nothing created yet.
    Pending,
    /// Instance exists on the hypervisor.
    Created,
    /// Guest has been bootstrapped.
    Configured,
    /// Reachable over its forwarded SSH port.
    Active,
    /// A step failed; identifiers stay reserved until reclaimed.
    Error,
    /// Torn down; identifiers released.
    Deleted,
}

impl ContainerStatus {
    /// Returns whether `self → next` is an edge of the status graph.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ContainerStatus::{Active, Configured, Created, Deleted, Error, Pending};
        matches!(
            (self, next),
            (Pending, Created)
                | (Created, Configured)
                | (Configured, Active)
                | (Pending | Created | Configured | Active, Error)
                | (Active | Error, Deleted)
        )
    }

    /// Returns whether no transition leaves this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Configured => write!(f, "configured"),
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// Whether the guest is believed to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Guest is running.
    Running,
    /// Guest is stopped.
    Stopped,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Ordered steps of the provisioning pipeline, plus teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    /// Identifier allocation and pending record.
    Reserve,
    /// Check that the id is free on the hypervisor.
    Precheck,
    /// Instance creation on the hypervisor.
    Create,
    /// Baseline firewall profile.
    BaselinePolicy,
    /// Guest package and service setup.
    Bootstrap,
    /// SSH port forwarding rule.
    Forward,
    /// Deletion of the instance.
    Teardown,
}

impl ProvisionStep {
    /// Returns whether a failure at this step may have left an instance
    /// behind on the hypervisor that belongs to this record.
    #[must_use]
    pub const fn may_own_instance(self) -> bool {
        !matches!(self, Self::Reserve | Self::Precheck)
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserve => "reserve",
            Self::Precheck => "precheck",
            Self::Create => "create",
            Self::BaselinePolicy => "baseline_policy",
            Self::Bootstrap => "bootstrap",
            Self::Forward => "forward",
            Self::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

/// Why and when a record entered `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Step that failed.
    pub step: ProvisionStep,
    /// Diagnostic text.
    pub reason: String,
    /// Moment the failure was recorded.
    pub at: DateTime<Utc>,
}

/// Durable record of one user container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Storage key, stable across id reuse.
    pub key: Uuid,
    /// Hypervisor id, unique among non-deleted records.
    pub id: ContainerId,
    /// Display name, also used as hostname.
    pub name: String,
    /// Account owning the container.
    pub owner: OwnerId,
    /// Plan the resources were derived from.
    pub plan: String,
    /// Resource quantities, fixed at creation.
    pub resources: ResourceSpec,
    /// Network identity.
    pub network: NetworkSpec,
    /// Template name the instance was created from.
    pub template: String,
    credential: Credential,
    status: ContainerStatus,
    /// Whether the guest is running.
    pub power: PowerState,
    /// Set while in `error`.
    pub failure: Option<FailureInfo>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set only on deletion; drives the retention sweep.
    pub expiry: Option<DateTime<Utc>>,
}

/// Inputs for a freshly reserved record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Allocated id.
    pub id: ContainerId,
    /// Display name.
    pub name: String,
    /// Owning account.
    pub owner: OwnerId,
    /// Plan name.
    pub plan: String,
    /// Plan quantities.
    pub resources: ResourceSpec,
    /// Allocated network identity.
    pub network: NetworkSpec,
    /// Template name.
    pub template: String,
    /// Generated root credential.
    pub credential: Credential,
}

impl ContainerRecord {
    /// Creates a record in `pending`.
    #[must_use]
    pub fn pending(new: NewRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: Uuid::new_v4(),
            id: new.id,
            name: new.name,
            owner: new.owner,
            plan: new.plan,
            resources: new.resources,
            network: new.network,
            template: new.template,
            credential: new.credential,
            status: ContainerStatus::Pending,
            power: PowerState::Stopped,
            failure: None,
            created_at: now,
            updated_at: now,
            expiry: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ContainerStatus {
        self.status
    }

    /// Root credential, written once at reservation.
    #[must_use]
    pub const fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Moves the record along the status graph.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::InvalidState`] if `next` is not reachable from
    /// the current status.
    pub fn advance(&mut self, next: ContainerStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(invalid_state(self.id, self.status, "transition"));
        }
        tracing::debug!(id = %self.id, from = %self.status, to = %next, "status transition");
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Moves the record to `error`, remembering the failing step.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::InvalidState`] if the record is already
    /// `error` or `deleted`.
    pub fn fail(
        &mut self,
        step: ProvisionStep,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.advance(ContainerStatus::Error, now)?;
        self.failure = Some(FailureInfo {
            step,
            reason: reason.into(),
            at: now,
        });
        Ok(())
    }

    /// Moves the record to `deleted` and stamps its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::InvalidState`] unless the record is `active`
    /// or `error`.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.advance(ContainerStatus::Deleted, now)?;
        self.power = PowerState::Stopped;
        self.expiry = Some(now);
        Ok(())
    }

    /// Records a failed teardown. An `error` record keeps its status and
    /// only has its failure replaced; a failure that never owned an
    /// instance keeps its step so the instance is never destroyed later.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::InvalidState`] for a `deleted` record.
    pub fn fail_teardown(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status != ContainerStatus::Error {
            return self.fail(ProvisionStep::Teardown, reason, now);
        }
        let step = match &self.failure {
            Some(failure) if !failure.step.may_own_instance() => failure.step,
            _ => ProvisionStep::Teardown,
        };
        self.failure = Some(FailureInfo {
            step,
            reason: reason.into(),
            at: now,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Whether the hypervisor instance with this id belongs to the
    /// record. False when provisioning stopped before creating it.
    #[must_use]
    pub fn owns_instance(&self) -> bool {
        self.failure
            .as_ref()
            .is_none_or(|failure| failure.step.may_own_instance())
    }

    /// Whether this record still holds its id, address, and port.
    #[must_use]
    pub fn holds_identifiers(&self) -> bool {
        self.status != ContainerStatus::Deleted
    }

    /// Whether `owner` owns this record.
    #[must_use]
    pub fn is_owned_by(&self, owner: &OwnerId) -> bool {
        &self.owner == owner
    }

    /// The SSH forwarding rule this record is reachable through.
    #[must_use]
    pub const fn ssh_rule(&self) -> NatRule {
        NatRule {
            external_port: self.network.ssh_port,
            internal_ip: self.network.private_ip,
            internal_port: crate::constants::GUEST_SSH_PORT,
        }
    }
}
