//! Structured firewall rules and their single textual form.
//!
//! A rule is data. [`FirewallRule::args`] is the only place that turns it
//! into `iptables` arguments; the persisted rule files hold the same
//! arguments and are parsed back with [`FirewallRule::parse`].

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::NatRule;
use vpsforge_exec::CommandSpec;

/// What an `iptables` invocation does with a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`: append to the chain.
    Append,
    /// `-C`: exit 0 if the rule is live, 1 otherwise.
    Check,
    /// `-D`: remove one copy.
    Delete,
}

impl RuleOp {
    /// Command line flag.
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Check => "-C",
            Self::Delete => "-D",
        }
    }

    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-A" => Some(Self::Append),
            "-C" => Some(Self::Check),
            "-D" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One live firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirewallRule {
    /// `nat PREROUTING`: redirect a host port to a guest address.
    Dnat {
        /// Host port.
        external_port: u16,
        /// Guest address and port.
        destination: SocketAddrV4,
    },
    /// `filter FORWARD`: accept redirected traffic towards the guest.
    ForwardAccept {
        /// Guest address and port.
        destination: SocketAddrV4,
    },
}

impl FirewallRule {
    /// The rules realising a forward, in apply order.
    #[must_use]
    pub const fn for_forward(rule: &NatRule) -> [Self; 2] {
        let destination = SocketAddrV4::new(rule.internal_ip, rule.internal_port);
        [
            Self::Dnat {
                external_port: rule.external_port,
                destination,
            },
            Self::ForwardAccept { destination },
        ]
    }

    /// Recovers the forward described by a set of rules.
    #[must_use]
    pub fn forward_of(rules: &[Self]) -> Option<NatRule> {
        rules.iter().find_map(|rule| match *rule {
            Self::Dnat {
                external_port,
                destination,
            } => Some(NatRule {
                external_port,
                internal_ip: *destination.ip(),
                internal_port: destination.port(),
            }),
            Self::ForwardAccept { .. } => None,
        })
    }

    /// Table the rule lives in.
    #[must_use]
    pub const fn table(&self) -> &'static str {
        match self {
            Self::Dnat { .. } => "nat",
            Self::ForwardAccept { .. } => "filter",
        }
    }

    /// Chain the rule lives in.
    #[must_use]
    pub const fn chain(&self) -> &'static str {
        match self {
            Self::Dnat { .. } => "PREROUTING",
            Self::ForwardAccept { .. } => "FORWARD",
        }
    }

    /// `iptables` arguments for `op` on this rule.
    #[must_use]
    pub fn args(&self, op: RuleOp) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(12);
        if let Self::Dnat { .. } = self {
            args.extend(["-t".into(), "nat".into()]);
        }
        args.extend([op.flag().into(), self.chain().into(), "-p".into(), "tcp".into()]);
        match self {
            Self::Dnat {
                external_port,
                destination,
            } => args.extend([
                "--dport".into(),
                external_port.to_string(),
                "-j".into(),
                "DNAT".into(),
                "--to-destination".into(),
                destination.to_string(),
            ]),
            Self::ForwardAccept { destination } => args.extend([
                "-d".into(),
                destination.ip().to_string(),
                "--dport".into(),
                destination.port().to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ]),
        }
        args
    }

    /// The command applying `op` to this rule.
    #[must_use]
    pub fn command(&self, op: RuleOp, iptables: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(iptables).args(self.args(op)).timeout(timeout)
    }

    /// The persisted line for `op`.
    #[must_use]
    pub fn render(&self, op: RuleOp) -> String {
        format!("iptables {}", self.args(op).join(" "))
    }

    /// Parses a line produced by [`FirewallRule::render`].
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Persistence`] for anything else.
    pub fn parse(line: &str) -> Result<(RuleOp, Self)> {
        let malformed = |why: &str| ForgeError::persistence(format!("rule line `{line}`: {why}"));
        let mut tokens = line.split_whitespace();
        if !tokens.next().is_some_and(|p| p.ends_with("iptables")) {
            return Err(malformed("not an iptables line"));
        }

        let mut table = "filter";
        let mut op_chain = None;
        let mut dest_ip: Option<Ipv4Addr> = None;
        let mut dport: Option<u16> = None;
        let mut target = None;
        let mut to: Option<SocketAddrV4> = None;
        while let Some(token) = tokens.next() {
            let mut value = || tokens.next().ok_or_else(|| malformed("missing value"));
            match token {
                "-t" => table = value()?,
                "-p" => {
                    if !value()?.eq_ignore_ascii_case("tcp") {
                        return Err(malformed("only tcp is supported"));
                    }
                }
                "-d" => dest_ip = Some(value()?.parse().map_err(|_| malformed("bad address"))?),
                "--dport" => dport = Some(value()?.parse().map_err(|_| malformed("bad port"))?),
                "-j" => target = Some(value()?),
                "--to-destination" => {
                    to = Some(value()?.parse().map_err(|_| malformed("bad destination"))?);
                }
                flag => {
                    let op = RuleOp::from_flag(flag).ok_or_else(|| malformed("unknown flag"))?;
                    op_chain = Some((op, value()?));
                }
            }
        }

        let (op, chain) = op_chain.ok_or_else(|| malformed("no chain operation"))?;
        let rule = match (table, chain, target, dport, dest_ip, to) {
            ("nat", "PREROUTING", Some("DNAT"), Some(external_port), _, Some(destination)) => {
                Self::Dnat {
                    external_port,
                    destination,
                }
            }
            ("filter", "FORWARD", Some("ACCEPT"), Some(port), Some(ip), None) => {
                Self::ForwardAccept {
                    destination: SocketAddrV4::new(ip, port),
                }
            }
            _ => return Err(malformed("unsupported rule shape")),
        };
        Ok((op, rule))
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(RuleOp::Append))
    }
}
