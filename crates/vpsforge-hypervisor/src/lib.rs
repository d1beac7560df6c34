//! Hypervisor control plane abstraction for vpsforge.
//!
//! The orchestrator addresses instances by node and numeric id. Two
//! backends implement [`Hypervisor`]:
//! - [`pct::PctHypervisor`]: drives the `pct` command line on the host.
//! - [`api::ProxmoxApi`]: talks to the HTTPS management API.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod pct;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vpsforge_common::config::{BackendKind, ForgeConfig};
use vpsforge_common::error::Result;
use vpsforge_common::types::{ContainerId, Credential, OsFamily, ResourceSpec};
use vpsforge_exec::{CommandExecutor, ExecOutput};

/// Runtime state of an instance as seen by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Instance exists and is running.
    Running,
    /// Instance exists and is stopped.
    Stopped,
    /// No instance with that id.
    Missing,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// Guest NIC description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    /// Host bridge.
    pub bridge: String,
    /// Guest address.
    pub ip: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Optional bandwidth limit in MB/s.
    pub rate_mbps: Option<u32>,
}

impl NetworkDescriptor {
    /// The `net0` option value understood by both backends.
    #[must_use]
    pub fn render(&self) -> String {
        let mut value = format!(
            "name=eth0,bridge={},firewall=1,gw={},ip={}/{}",
            self.bridge, self.gateway, self.ip, self.prefix_len
        );
        if let Some(rate) = self.rate_mbps {
            value.push_str(&format!(",rate={rate}"));
        }
        value
    }
}

/// Everything needed to create an instance.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Id to create the instance under.
    pub id: ContainerId,
    /// Guest hostname.
    pub hostname: String,
    /// Memory, cores, and disk.
    pub resources: ResourceSpec,
    /// Network interface.
    pub network: NetworkDescriptor,
    /// Template volume id.
    pub template_volume: String,
    /// OS family of the template.
    pub os_family: OsFamily,
    /// Initial root password.
    pub root_credential: Credential,
    /// Storage for the root filesystem.
    pub storage: String,
    /// Swap in MiB.
    pub swap_mb: u32,
    /// Start the instance once created.
    pub start: bool,
}

impl CreateSpec {
    /// The `rootfs` option value (`storage:sizeGB`).
    #[must_use]
    pub fn rootfs(&self) -> String {
        format!("{}:{}", self.storage, self.resources.disk_gb)
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Created id.
    pub id: ContainerId,
    /// Node hosting the instance.
    pub node: String,
    /// Guest hostname.
    pub hostname: String,
}

/// A script run inside a guest through an interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    /// Interpreter inside the guest, e.g. `sh`.
    pub shell: String,
    /// Script passed to `shell -c`.
    pub script: String,
    /// Time budget.
    pub timeout: Duration,
}

impl GuestCommand {
    /// A script for `/bin/sh`.
    #[must_use]
    pub fn sh(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: "sh".into(),
            script: script.into(),
            timeout,
        }
    }
}

/// A template archive available on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    /// Volume id, e.g. `local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst`.
    pub volume: String,
    /// Archive size in bytes, when reported.
    pub size_bytes: Option<u64>,
}

/// Control plane of the hypervisor node.
///
/// Implementations must bound every call by a timeout.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Returns the runtime status of an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane cannot be queried.
    async fn status(&self, id: ContainerId) -> Result<InstanceStatus>;

    /// Returns whether an instance with `id` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane cannot be queried.
    async fn exists(&self, id: ContainerId) -> Result<bool> {
        Ok(self.status(id).await? != InstanceStatus::Missing)
    }

    /// Creates an instance. Not idempotent; callers check
    /// [`Hypervisor::exists`] first.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails or times out.
    async fn create(&self, spec: &CreateSpec) -> Result<InstanceDescriptor>;

    /// Starts an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane refuses or times out.
    async fn start(&self, id: ContainerId) -> Result<()>;

    /// Stops an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane refuses or times out.
    async fn stop(&self, id: ContainerId) -> Result<()>;

    /// Removes an instance and its volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane refuses or times out.
    async fn destroy(&self, id: ContainerId) -> Result<()>;

    /// Runs a command inside a guest. A non-zero exit is returned, not
    /// raised.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be run or times out.
    async fn exec(&self, id: ContainerId, command: &GuestCommand) -> Result<ExecOutput>;

    /// Lists template archives on the node.
    ///
    /// # Errors
    ///
    /// Returns an error if the control plane cannot be queried.
    async fn list_templates(&self) -> Result<Vec<TemplateInfo>>;
}

/// Builds the backend selected by `config.hypervisor.backend`.
///
/// `executor` runs `pct` for the CLI backend and guest commands for both.
///
/// # Errors
///
/// Returns an error if the API backend is selected without a URL or
/// credentials, or its HTTP client cannot be built.
pub fn connect(
    config: &ForgeConfig,
    executor: Arc<dyn CommandExecutor>,
) -> Result<Arc<dyn Hypervisor>> {
    match config.hypervisor.backend {
        BackendKind::Cli => {
            tracing::info!(node = %config.hypervisor.node, "using pct command line backend");
            Ok(Arc::new(pct::PctHypervisor::new(
                executor,
                config.hypervisor.node.clone(),
                config.hypervisor.template_storage.clone(),
                config.timeouts.command(),
            )))
        }
        BackendKind::Api => {
            tracing::info!(node = %config.hypervisor.node, "using management API backend");
            Ok(Arc::new(api::ProxmoxApi::from_config(config, executor)?))
        }
    }
}
