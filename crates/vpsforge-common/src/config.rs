//! Global configuration model for vpsforge.
//!
//! The whole configuration is one immutable value, loaded once and handed
//! to every component at construction.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{ForgeError, Result};
use crate::types::{OsFamily, ResourceSpec};

/// Root configuration for vpsforge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Base directory for vpsforge state and data.
    pub data_dir: PathBuf,
    /// Path to the container record store.
    pub state_file: PathBuf,
    /// Control plane connection settings.
    pub hypervisor: HypervisorConfig,
    /// Bounds of the identifier pools.
    pub allocation: AllocationConfig,
    /// Private guest network.
    pub network: NetworkConfig,
    /// Named resource plans.
    pub plans: BTreeMap<String, ResourceSpec>,
    /// Named OS templates.
    pub templates: BTreeMap<String, TemplateSpec>,
    /// Firewall rule storage and guest profile settings.
    pub firewall: FirewallConfig,
    /// Guest bootstrap settings.
    pub guest: GuestConfig,
    /// Time budgets for external calls.
    pub timeouts: TimeoutConfig,
    /// Seconds an `error` record keeps its identifiers before reclaim.
    pub reclaim_grace_secs: u64,
    /// Audit notification sink.
    pub notify: NotifyConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            state_file: PathBuf::from(constants::DEFAULT_STATE_FILE),
            hypervisor: HypervisorConfig::default(),
            allocation: AllocationConfig::default(),
            network: NetworkConfig::default(),
            plans: default_plans(),
            templates: default_templates(),
            firewall: FirewallConfig::default(),
            guest: GuestConfig::default(),
            timeouts: TimeoutConfig::default(),
            reclaim_grace_secs: constants::DEFAULT_RECLAIM_GRACE_SECS,
            notify: NotifyConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Loads and validates a YAML configuration file.
    ///
    /// Missing sections fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or
    /// fails [`ForgeConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid YAML or fails validation.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| ForgeError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Config`] describing the first violated
    /// constraint.
    pub fn validate(&self) -> Result<()> {
        if self.plans.is_empty() {
            return Err(config_error("at least one plan must be configured"));
        }
        for (name, plan) in &self.plans {
            if plan.memory_mb == 0 || plan.cpu_cores == 0 || plan.disk_gb == 0 {
                return Err(config_error(format!("plan {name} has a zero quantity")));
            }
        }
        if self.templates.is_empty() {
            return Err(config_error("at least one template must be configured"));
        }
        self.allocation.validate()?;
        self.network.validate(&self.allocation)?;
        self.guest.validate()?;
        if self.hypervisor.node.trim().is_empty() {
            return Err(config_error("hypervisor.node must not be empty"));
        }
        if self.hypervisor.backend == BackendKind::Api && self.hypervisor.api_url.is_none() {
            return Err(config_error("hypervisor.api_url is required for the api backend"));
        }
        Ok(())
    }

    /// Looks up a plan by name.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Validation`] for an unknown plan.
    pub fn plan(&self, name: &str) -> Result<ResourceSpec> {
        self.plans
            .get(name)
            .copied()
            .ok_or_else(|| ForgeError::validation(format!("unknown plan: {name}")))
    }

    /// Looks up a template by name.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Validation`] for an unknown template.
    pub fn template(&self, name: &str) -> Result<&TemplateSpec> {
        self.templates
            .get(name)
            .ok_or_else(|| ForgeError::validation(format!("unknown template: {name}")))
    }

    /// Grace period before failed records are reclaimed.
    #[must_use]
    pub const fn reclaim_grace(&self) -> Duration {
        Duration::from_secs(self.reclaim_grace_secs)
    }
}

fn config_error(message: impl Into<String>) -> ForgeError {
    ForgeError::Config {
        message: message.into(),
    }
}

fn default_plans() -> BTreeMap<String, ResourceSpec> {
    let plan = |memory_mb, cpu_cores, disk_gb| ResourceSpec {
        memory_mb,
        cpu_cores,
        disk_gb,
    };
    BTreeMap::from([
        ("basic".to_string(), plan(512, 1, 8)),
        ("standard".to_string(), plan(1024, 2, 20)),
        ("premium".to_string(), plan(2048, 4, 50)),
    ])
}

fn default_templates() -> BTreeMap<String, TemplateSpec> {
    BTreeMap::from([
        (
            "alpine".to_string(),
            TemplateSpec {
                volume: "local:vztmpl/alpine-3.20-default_20240908_amd64.tar.xz".into(),
                family: OsFamily::Alpine,
            },
        ),
        (
            "debian".to_string(),
            TemplateSpec {
                volume: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".into(),
                family: OsFamily::Debian,
            },
        ),
    ])
}

/// Which control plane implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The `pct` command line on the hypervisor host.
    #[default]
    Cli,
    /// The HTTPS management API.
    Api,
}

/// How the API backend authenticates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ApiAuth {
    /// Username/password exchanged for a session ticket per call.
    Ticket {
        /// Login name including realm, e.g. `root@pam`.
        username: String,
        /// Login password.
        password: String,
    },
    /// Pre-shared API token.
    Token {
        /// Token id, e.g. `root@pam!vpsforge`.
        token_id: String,
        /// Token secret.
        secret: String,
    },
}

/// Control plane connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Node that hosts the containers.
    pub node: String,
    /// Backend implementation.
    pub backend: BackendKind,
    /// Base URL of the API, e.g. `https://pve:8006/api2/json`.
    pub api_url: Option<String>,
    /// API credentials.
    pub auth: Option<ApiAuth>,
    /// Accept self-signed API certificates.
    pub insecure_tls: bool,
    /// Storage the root filesystem is allocated on.
    pub storage: String,
    /// Storage holding container templates.
    pub template_storage: String,
    /// Swap in MiB given to every guest.
    pub swap_mb: u32,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            node: "pve".into(),
            backend: BackendKind::Cli,
            api_url: None,
            auth: None,
            insecure_tls: false,
            storage: "local".into(),
            template_storage: "local".into(),
            swap_mb: 256,
        }
    }
}

/// Bounds of the identifier pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Smallest container id.
    pub id_base: u32,
    /// Largest container id.
    pub id_max: u32,
    /// Smallest host offset in the private subnet.
    pub ip_offset_base: u32,
    /// Largest host offset in the private subnet.
    pub ip_offset_max: u32,
    /// Smallest forwarded SSH port.
    pub ssh_port_min: u16,
    /// Largest forwarded SSH port.
    pub ssh_port_max: u16,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            id_base: constants::DEFAULT_ID_BASE,
            id_max: 999_999_999,
            ip_offset_base: constants::DEFAULT_IP_OFFSET_BASE,
            ip_offset_max: constants::DEFAULT_IP_OFFSET_MAX,
            ssh_port_min: constants::DEFAULT_SSH_PORT_MIN,
            ssh_port_max: constants::DEFAULT_SSH_PORT_MAX,
        }
    }
}

impl AllocationConfig {
    fn validate(&self) -> Result<()> {
        if self.id_base > self.id_max {
            return Err(config_error("allocation.id_base exceeds allocation.id_max"));
        }
        if self.ip_offset_base == 0 || self.ip_offset_base > self.ip_offset_max {
            return Err(config_error("allocation ip offsets are inverted or zero"));
        }
        if self.ssh_port_min == 0 || self.ssh_port_min > self.ssh_port_max {
            return Err(config_error("allocation ssh port range is inverted or zero"));
        }
        Ok(())
    }
}

/// Private guest network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host bridge the guests attach to.
    pub bridge: String,
    /// Network address of the guest subnet.
    pub subnet: Ipv4Addr,
    /// Prefix length of the guest subnet.
    pub prefix_len: u8,
    /// Default gateway handed to guests.
    pub gateway: Ipv4Addr,
    /// Optional per-guest bandwidth limit in MB/s.
    pub rate_mbps: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: "vmbr1".into(),
            subnet: Ipv4Addr::new(10, 10, 10, 0),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 10, 10, 1),
            rate_mbps: None,
        }
    }
}

impl NetworkConfig {
    fn validate(&self, allocation: &AllocationConfig) -> Result<()> {
        if !(8..=30).contains(&self.prefix_len) {
            return Err(config_error("network.prefix_len must be within 8..=30"));
        }
        let host_bits = 32 - u32::from(self.prefix_len);
        let last_host = (1_u32 << host_bits) - 2;
        if allocation.ip_offset_max > last_host {
            return Err(config_error(format!(
                "allocation.ip_offset_max {} exceeds the /{} subnet",
                allocation.ip_offset_max, self.prefix_len
            )));
        }
        if u32::from(self.subnet) & ((1_u32 << host_bits) - 1) != 0 {
            return Err(config_error("network.subnet is not a network address"));
        }
        Ok(())
    }

    /// Address of the host at `offset` inside the subnet.
    #[must_use]
    pub fn address_at(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet).wrapping_add(offset))
    }

    /// Offset of `ip` inside the subnet, if it belongs to it.
    #[must_use]
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        let host_bits = 32 - u32::from(self.prefix_len);
        let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
        let raw = u32::from(ip);
        (raw & mask == u32::from(self.subnet)).then(|| raw & !mask)
    }
}

/// A named OS image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Volume id of the template archive.
    pub volume: String,
    /// OS family, deciding the bootstrap script.
    pub family: OsFamily,
}

/// Firewall rule storage and guest profile settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Directory of persisted NAT rule specifications.
    pub rules_dir: PathBuf,
    /// Directory of per-guest firewall profiles.
    pub profile_dir: PathBuf,
    /// Profile file inside `profile_dir` copied onto every new guest.
    pub baseline_profile: String,
    /// `iptables` binary used for live rules.
    pub iptables: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            rules_dir: PathBuf::from(constants::DEFAULT_RULES_DIR),
            profile_dir: PathBuf::from(constants::DEFAULT_PROFILE_DIR),
            baseline_profile: constants::DEFAULT_BASELINE_PROFILE.into(),
            iptables: "iptables".into(),
        }
    }
}

/// Guest bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestConfig {
    /// Login banner written to `/etc/motd`.
    pub motd: String,
    /// Interactive shell made default for root.
    pub shell: String,
    /// Extra packages installed next to the baseline tooling.
    pub packages: Vec<String>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            motd: "\tWelcome to your vpsforge container.".into(),
            shell: "/bin/zsh".into(),
            packages: Vec::new(),
        }
    }
}

impl GuestConfig {
    fn validate(&self) -> Result<()> {
        let plain = |text: &str, extra: &str| {
            !text.is_empty()
                && text
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || extra.contains(c))
        };
        if !self.shell.starts_with('/') || !plain(&self.shell, "/._-") {
            return Err(config_error(
                "guest.shell must be an absolute path of plain characters",
            ));
        }
        if let Some(bad) = self.packages.iter().find(|p| !plain(p, "+._-")) {
            return Err(config_error(format!("guest package name {bad:?} is invalid")));
        }
        Ok(())
    }
}

/// Time budgets for external calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a host command, in seconds.
    pub command_secs: u64,
    /// Budget for a single guest bootstrap command, in seconds.
    pub bootstrap_secs: u64,
    /// Budget for an API call including task completion, in seconds.
    pub api_secs: u64,
    /// Interval between task status polls, in milliseconds.
    pub task_poll_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: constants::DEFAULT_COMMAND_TIMEOUT_SECS,
            bootstrap_secs: constants::DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            api_secs: constants::DEFAULT_API_TIMEOUT_SECS,
            task_poll_ms: constants::DEFAULT_TASK_POLL_MS,
        }
    }
}

impl TimeoutConfig {
    /// Budget for a host command.
    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    /// Budget for a guest bootstrap command.
    #[must_use]
    pub const fn bootstrap(&self) -> Duration {
        Duration::from_secs(self.bootstrap_secs)
    }

    /// Budget for an API call.
    #[must_use]
    pub const fn api(&self) -> Duration {
        Duration::from_secs(self.api_secs)
    }

    /// Interval between task polls.
    #[must_use]
    pub const fn task_poll(&self) -> Duration {
        Duration::from_millis(self.task_poll_ms)
    }
}

/// Audit notification sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving `{"content": ...}` messages.
    pub webhook_url: Option<String>,
}
