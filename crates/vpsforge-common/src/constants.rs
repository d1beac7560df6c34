//! System-wide constants and default paths.

/// Default base directory for vpsforge data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/vpsforge";
/// Default state file path.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/vpsforge/state.json";
/// Default directory holding persisted NAT rule specifications.
pub const DEFAULT_RULES_DIR: &str = "/var/lib/vpsforge/nat";
/// Default configuration file consulted by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/vpsforge/config.yaml";

/// Proxmox per-guest firewall configuration directory.
pub const DEFAULT_PROFILE_DIR: &str = "/etc/pve/firewall";
/// Firewall profile copied onto every new guest.
pub const DEFAULT_BASELINE_PROFILE: &str = "baseline.fw";

/// Port the guest SSH daemon listens on.
pub const GUEST_SSH_PORT: u16 = 22;

/// First container id handed out by the allocator.
pub const DEFAULT_ID_BASE: u32 = 100;
/// First host offset inside the private subnet (`.1` is the gateway).
pub const DEFAULT_IP_OFFSET_BASE: u32 = 3;
/// Last host offset inside the private subnet.
pub const DEFAULT_IP_OFFSET_MAX: u32 = 254;
/// Lower bound of the forwarded SSH port range.
pub const DEFAULT_SSH_PORT_MIN: u16 = 2000;
/// Upper bound of the forwarded SSH port range.
pub const DEFAULT_SSH_PORT_MAX: u16 = 60000;

/// Length of generated root credentials.
pub const CREDENTIAL_LENGTH: usize = 20;

/// Number of random draws attempted before scanning the port range.
pub const PORT_DRAW_ATTEMPTS: usize = 64;

/// Default timeout for a single host command, in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
/// Default timeout for a single guest bootstrap command, in seconds.
pub const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 600;
/// Default timeout for hypervisor API calls including task completion.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 300;
/// Default interval between task status polls, in milliseconds.
pub const DEFAULT_TASK_POLL_MS: u64 = 1000;
/// How long a writer waits for a host-wide file lock, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
/// Default grace period before failed records release their identifiers.
pub const DEFAULT_RECLAIM_GRACE_SECS: u64 = 24 * 60 * 60;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "vpsforge";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "vpsf";
