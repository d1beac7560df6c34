//! In-memory `iptables` for tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_exec::{CommandExecutor, CommandSpec, ExecOutput};

use crate::rule::{FirewallRule, RuleOp};

#[derive(Debug, Clone, PartialEq, Eq)]
struct LiveRule {
    table: String,
    chain: String,
    spec: Vec<String>,
}

impl LiveRule {
    fn render(&self) -> String {
        let table = if self.table == "filter" {
            String::new()
        } else {
            format!("-t {} ", self.table)
        };
        format!("iptables {table}-A {} {}", self.chain, self.spec.join(" "))
    }
}

#[derive(Default)]
struct SimState {
    rules: Vec<LiveRule>,
    calls: Vec<String>,
    append_failure: Option<String>,
}

/// Executor behaving like `iptables` over an in-memory rule multiset.
///
/// `-C` exits 0 when a matching rule is live and 1 otherwise, `-A` adds a
/// copy, `-D` removes one copy or exits 1. A flush simulates a reboot.
#[derive(Clone, Default)]
pub struct IptablesSimulator {
    state: Arc<Mutex<SimState>>,
}

impl IptablesSimulator {
    /// Creates a simulator with no live rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live rules in append form, in chain order.
    #[must_use]
    pub fn live(&self) -> Vec<String> {
        self.lock().rules.iter().map(LiveRule::render).collect()
    }

    /// Number of live rules.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock().rules.len()
    }

    /// Number of live copies of `rule`.
    #[must_use]
    pub fn copies_of(&self, rule: &FirewallRule) -> usize {
        let line = rule.render(RuleOp::Append);
        self.live().iter().filter(|l| **l == line).count()
    }

    /// Adds a live copy of `rule` behind the manager's back.
    pub fn inject(&self, rule: &FirewallRule) {
        let live = parse(&rule.args(RuleOp::Append));
        if let Some((_, live)) = live {
            self.lock().rules.push(live);
        }
    }

    /// Drops every live rule.
    pub fn flush(&self) {
        self.lock().rules.clear();
    }

    /// Makes every `-A` fail with `stderr`.
    pub fn fail_appends(&self, stderr: impl Into<String>) {
        self.lock().append_failure = Some(stderr.into());
    }

    /// Rendered command lines seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

fn parse(args: &[String]) -> Option<(RuleOp, LiveRule)> {
    let mut rest = args;
    let mut table = "filter".to_string();
    if rest.first().map(String::as_str) == Some("-t") {
        table = rest.get(1)?.clone();
        rest = rest.get(2..)?;
    }
    let op = match rest.first()?.as_str() {
        "-A" => RuleOp::Append,
        "-C" => RuleOp::Check,
        "-D" => RuleOp::Delete,
        _ => return None,
    };
    let chain = rest.get(1)?.clone();
    let spec = rest.get(2..)?.to_vec();
    Some((op, LiveRule { table, chain, spec }))
}

#[async_trait]
impl CommandExecutor for IptablesSimulator {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecOutput> {
        let mut state = self.lock();
        state.calls.push(spec.to_string());
        let Some((op, rule)) = parse(spec.arguments()) else {
            return Err(ForgeError::external(
                spec.to_string(),
                "simulator cannot parse arguments",
            ));
        };
        let position = state.rules.iter().position(|live| *live == rule);
        let output = match (op, position) {
            (RuleOp::Check, Some(_)) => ExecOutput::ok(""),
            (RuleOp::Check | RuleOp::Delete, None) => ExecOutput::failed(
                1,
                "iptables: Bad rule (does a matching rule exist in that chain?).",
            ),
            (RuleOp::Delete, Some(index)) => {
                let _ = state.rules.remove(index);
                ExecOutput::ok("")
            }
            (RuleOp::Append, _) => match state.append_failure.clone() {
                Some(stderr) => ExecOutput::failed(4, stderr),
                None => {
                    state.rules.push(rule);
                    ExecOutput::ok("")
                }
            },
        };
        Ok(output)
    }
}
