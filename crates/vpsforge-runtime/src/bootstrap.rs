//! Guest bootstrap scripts.
//!
//! Each step is a short `sh` script run inside the guest. Every script is
//! safe to run again: package installs are no-ops when installed, the
//! `sshd` option is rewritten in place, and the banner and root shell are
//! overwritten.

use vpsforge_common::config::GuestConfig;
use vpsforge_common::types::OsFamily;

/// Packages every guest gets next to its login shell.
const BASE_PACKAGES: &[&str] = &["git", "wget", "curl", "htop", "sudo", "bash"];

/// One named bootstrap script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    /// Short label used in logs and diagnostics.
    pub name: &'static str,
    /// Script passed to `sh -c`.
    pub script: String,
}

impl BootstrapStep {
    fn new(name: &'static str, script: impl Into<String>) -> Self {
        Self {
            name,
            script: script.into(),
        }
    }
}

/// Quotes `text` as one `sh` word.
#[must_use]
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

/// Packages to install for `family`, login shell and extras included.
fn packages(family: OsFamily, guest: &GuestConfig) -> Vec<String> {
    let ssh = match family {
        OsFamily::Alpine => "openssh",
        OsFamily::Debian => "openssh-server",
    };
    let mut list: Vec<String> = std::iter::once(ssh)
        .chain(BASE_PACKAGES.iter().copied())
        .map(String::from)
        .collect();
    let shell = guest.shell.rsplit('/').next().unwrap_or_default();
    if !matches!(shell, "" | "sh" | "ash" | "bash") {
        list.push(shell.to_string());
    }
    for extra in &guest.packages {
        if !list.contains(extra) {
            list.push(extra.clone());
        }
    }
    list
}

const PERMIT_ROOT_LOGIN: &str = "f=/etc/ssh/sshd_config; \
     sed -i -E 's/^#?[[:space:]]*PermitRootLogin.*/PermitRootLogin yes/' \"$f\"; \
     grep -q '^PermitRootLogin yes' \"$f\" || echo 'PermitRootLogin yes' >> \"$f\"";

/// The ordered bootstrap steps for a guest of `family`.
#[must_use]
pub fn steps(family: OsFamily, guest: &GuestConfig) -> Vec<BootstrapStep> {
    let install = packages(family, guest)
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ");
    let banner = format!("printf '%s\\n' {} > /etc/motd", shell_quote(&guest.motd));
    let shell = shell_quote(&guest.shell);

    match family {
        OsFamily::Alpine => vec![
            BootstrapStep::new("refresh packages", "apk update"),
            BootstrapStep::new("install tooling", format!("apk add --no-cache {install}")),
            BootstrapStep::new(
                "enable ssh",
                format!(
                    "{PERMIT_ROOT_LOGIN} && rc-update add sshd default && \
                     (rc-service sshd restart || rc-service sshd start)"
                ),
            ),
            BootstrapStep::new("login banner", banner),
            BootstrapStep::new(
                "root shell",
                format!("sed -i -E \"s#^(root:[^:]*:[^:]*:[^:]*:[^:]*:[^:]*:).*#\\1\"{shell}\"#\" /etc/passwd"),
            ),
        ],
        OsFamily::Debian => vec![
            BootstrapStep::new(
                "refresh packages",
                "DEBIAN_FRONTEND=noninteractive apt-get update -q",
            ),
            BootstrapStep::new(
                "install tooling",
                format!("DEBIAN_FRONTEND=noninteractive apt-get install -y -q {install}"),
            ),
            BootstrapStep::new(
                "enable ssh",
                format!("{PERMIT_ROOT_LOGIN} && systemctl enable ssh && systemctl restart ssh"),
            ),
            BootstrapStep::new("login banner", banner),
            BootstrapStep::new("root shell", format!("chsh -s {shell} root")),
        ],
    }
}
