//! Backend driving the `pct` command line on the hypervisor host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::ContainerId;
use vpsforge_exec::{CommandExecutor, CommandSpec, ExecOutput};

use crate::{CreateSpec, GuestCommand, Hypervisor, InstanceDescriptor, InstanceStatus, TemplateInfo};

const PCT: &str = "pct";
const PVEAM: &str = "pveam";

/// Control plane access through `pct` and `pveam`.
pub struct PctHypervisor {
    executor: Arc<dyn CommandExecutor>,
    node: String,
    template_storage: String,
    timeout: Duration,
}

impl PctHypervisor {
    /// Creates a backend running its commands through `executor`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        node: String,
        template_storage: String,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            node,
            template_storage,
            timeout,
        }
    }

    fn pct(&self) -> CommandSpec {
        CommandSpec::new(PCT).timeout(self.timeout)
    }
}

/// Builds the `pct create` invocation for `spec`.
#[must_use]
pub fn create_command(spec: &CreateSpec, timeout: Duration) -> CommandSpec {
    let mut cmd = CommandSpec::new(PCT)
        .timeout(timeout)
        .arg("create")
        .arg(spec.id.to_string())
        .arg(&spec.template_volume)
        .arg("--hostname")
        .arg(&spec.hostname)
        .arg("--memory")
        .arg(spec.resources.memory_mb.to_string())
        .arg("--swap")
        .arg(spec.swap_mb.to_string())
        .arg("--cores")
        .arg(spec.resources.cpu_cores.to_string())
        .arg("--rootfs")
        .arg(spec.rootfs())
        .arg("--net0")
        .arg(spec.network.render())
        .arg("--ostype")
        .arg(spec.os_family.to_string())
        .arg("--password")
        .secret_arg(spec.root_credential.expose())
        .args(["--unprivileged", "1"])
        .args(["--features", "nesting=1,keyctl=1"])
        .args(["--cmode", "shell"]);
    if spec.start {
        cmd = cmd.args(["--start", "1"]);
    }
    cmd
}

/// Parses `pct status` output.
fn parse_status(output: &ExecOutput) -> Option<InstanceStatus> {
    let value = output.stdout.trim().strip_prefix("status:")?.trim();
    match value {
        "running" => Some(InstanceStatus::Running),
        "stopped" => Some(InstanceStatus::Stopped),
        _ => None,
    }
}

/// Parses `pveam list` output, skipping the header line.
fn parse_templates(stdout: &str) -> Vec<TemplateInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let volume = cols.next()?.to_string();
            let size_bytes = cols.next().and_then(parse_size);
            Some(TemplateInfo { volume, size_bytes })
        })
        .collect()
}

/// Parses sizes like `120.54MB` as printed by `pveam`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn parse_size(text: &str) -> Option<u64> {
    let (number, unit) = text.split_at(text.find(|c: char| c.is_ascii_alphabetic())?);
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "B" => 1_u64,
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

#[async_trait]
impl Hypervisor for PctHypervisor {
    async fn status(&self, id: ContainerId) -> Result<InstanceStatus> {
        let spec = self.pct().arg("status").arg(id.to_string());
        let output = self.executor.run(&spec).await?;
        if !output.success() && output.stderr.contains("does not exist") {
            return Ok(InstanceStatus::Missing);
        }
        let output = output.check(&spec)?;
        parse_status(&output).ok_or_else(|| {
            ForgeError::external(
                spec.to_string(),
                format!("unexpected status output: {}", output.stdout.trim()),
            )
        })
    }

    async fn create(&self, spec: &CreateSpec) -> Result<InstanceDescriptor> {
        let cmd = create_command(spec, self.timeout);
        tracing::info!(id = %spec.id, hostname = %spec.hostname, "creating container via pct");
        let _ = self.executor.run_checked(&cmd).await?;
        Ok(InstanceDescriptor {
            id: spec.id,
            node: self.node.clone(),
            hostname: spec.hostname.clone(),
        })
    }

    async fn start(&self, id: ContainerId) -> Result<()> {
        let spec = self.pct().arg("start").arg(id.to_string());
        let _ = self.executor.run_checked(&spec).await?;
        Ok(())
    }

    async fn stop(&self, id: ContainerId) -> Result<()> {
        let spec = self.pct().arg("stop").arg(id.to_string());
        let _ = self.executor.run_checked(&spec).await?;
        Ok(())
    }

    async fn destroy(&self, id: ContainerId) -> Result<()> {
        let spec = self
            .pct()
            .arg("destroy")
            .arg(id.to_string())
            .args(["--purge", "1"]);
        let _ = self.executor.run_checked(&spec).await?;
        Ok(())
    }

    async fn exec(&self, id: ContainerId, command: &GuestCommand) -> Result<ExecOutput> {
        let spec = guest_exec_command(id, command);
        self.executor.run(&spec).await
    }

    async fn list_templates(&self) -> Result<Vec<TemplateInfo>> {
        let spec = CommandSpec::new(PVEAM)
            .timeout(self.timeout)
            .arg("list")
            .arg(&self.template_storage);
        let output = self.executor.run_checked(&spec).await?;
        Ok(parse_templates(&output.stdout))
    }
}

/// Builds `pct exec <id> -- <shell> -c <script>`.
///
/// The script travels as a single argument; nothing is interpolated into
/// a host shell line.
#[must_use]
pub fn guest_exec_command(id: ContainerId, command: &GuestCommand) -> CommandSpec {
    CommandSpec::new(PCT)
        .timeout(command.timeout)
        .arg("exec")
        .arg(id.to_string())
        .arg("--")
        .arg(&command.shell)
        .arg("-c")
        .arg(&command.script)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use vpsforge_common::types::{Credential, OsFamily, ResourceSpec};
    use vpsforge_exec::recording::RecordingExecutor;

    use super::*;
    use crate::NetworkDescriptor;

    fn backend(exec: &RecordingExecutor) -> PctHypervisor {
        PctHypervisor::new(
            Arc::new(exec.clone()),
            "pve".into(),
            "local".into(),
            Duration::from_secs(30),
        )
    }

    fn create_spec() -> CreateSpec {
        CreateSpec {
            id: ContainerId::new(101),
            hostname: "web1".into(),
            resources: ResourceSpec {
                memory_mb: 1024,
                cpu_cores: 2,
                disk_gb: 20,
            },
            network: NetworkDescriptor {
                bridge: "vmbr1".into(),
                ip: Ipv4Addr::new(10, 10, 10, 3),
                prefix_len: 24,
                gateway: Ipv4Addr::new(10, 10, 10, 1),
                rate_mbps: None,
            },
            template_volume: "local:vztmpl/debian-12.tar.zst".into(),
            os_family: OsFamily::Debian,
            root_credential: Credential::new("topsecret"),
            storage: "local-lvm".into(),
            swap_mb: 256,
            start: true,
        }
    }

    #[tokio::test]
    async fn create_passes_every_parameter_and_masks_password() {
        let exec = RecordingExecutor::new();
        let descriptor = backend(&exec).create(&create_spec()).await.expect("create");
        assert_eq!(descriptor.id, ContainerId::new(101));
        assert_eq!(descriptor.node, "pve");

        let calls = exec.calls();
        assert_eq!(calls.len(), 1);
        let cmd = &calls[0];
        assert_eq!(cmd.program(), "pct");
        let args = cmd.arguments();
        assert_eq!(&args[..3], ["create", "101", "local:vztmpl/debian-12.tar.zst"]);
        for expected in [
            "web1",
            "1024",
            "local-lvm:20",
            "name=eth0,bridge=vmbr1,firewall=1,gw=10.10.10.1,ip=10.10.10.3/24",
            "topsecret",
        ] {
            assert!(cmd.has_arg(expected), "missing {expected} in {cmd}");
        }
        assert!(!cmd.to_string().contains("topsecret"));
        assert!(cmd.to_string().ends_with("--start 1"));
    }

    #[tokio::test]
    async fn create_failure_surfaces_stderr() {
        let exec = RecordingExecutor::new();
        exec.fail_when("pct create", "unable to create CT 101 - already exists");
        let err = backend(&exec).create(&create_spec()).await.unwrap_err();
        assert!(err.is_external());
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn status_maps_missing_instance() {
        let exec = RecordingExecutor::new();
        exec.respond_when(
            "pct status 250",
            ExecOutput::failed(2, "Configuration file 'nodes/pve/lxc/250.conf' does not exist"),
        );
        exec.respond_when("pct status 101", ExecOutput::ok("status: running\n"));
        let pct = backend(&exec);
        assert_eq!(
            pct.status(ContainerId::new(250)).await.unwrap(),
            InstanceStatus::Missing
        );
        assert!(!pct.exists(ContainerId::new(250)).await.unwrap());
        assert_eq!(
            pct.status(ContainerId::new(101)).await.unwrap(),
            InstanceStatus::Running
        );
    }

    #[tokio::test]
    async fn exec_keeps_script_as_single_argument() {
        let exec = RecordingExecutor::new();
        let command = GuestCommand::sh("apk update && apk add openssh", Duration::from_secs(60));
        let _ = backend(&exec)
            .exec(ContainerId::new(101), &command)
            .await
            .unwrap();
        let call = &exec.calls()[0];
        assert_eq!(
            call.arguments(),
            ["exec", "101", "--", "sh", "-c", "apk update && apk add openssh"]
        );
        assert_eq!(call.time_budget(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn destroy_purges_instance() {
        let exec = RecordingExecutor::new();
        backend(&exec).destroy(ContainerId::new(7)).await.unwrap();
        assert_eq!(exec.lines(), vec!["pct destroy 7 --purge 1"]);
    }

    #[test]
    fn parses_pveam_listing() {
        let stdout = "NAME                                                   SIZE\n\
local:vztmpl/alpine-3.20-default_20240908_amd64.tar.xz   3.16MB\n\
local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst     120.54MB\n";
        let templates = parse_templates(stdout);
        assert_eq!(templates.len(), 2);
        assert_eq!(
            templates[0].volume,
            "local:vztmpl/alpine-3.20-default_20240908_amd64.tar.xz"
        );
        assert!(templates[1].size_bytes.unwrap() > 120 * 1024 * 1024);
    }
}
