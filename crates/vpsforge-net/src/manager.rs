//! NAT Rule Manager.
//!
//! Writes go to the [`RuleStore`] first, then to the live firewall, so a
//! crash between the two is repaired by the next [`NatManager::reconcile`].
//! Every mutating operation holds the store's host lock, so separate
//! processes never interleave their rule list rewrites.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use vpsforge_common::config::ForgeConfig;
use vpsforge_common::constants::DEFAULT_LOCK_TIMEOUT_SECS;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::lock::HostLock;
use vpsforge_common::types::NatRule;
use vpsforge_exec::CommandExecutor;

use crate::rule::{FirewallRule, RuleOp};
use crate::store::RuleStore;

/// Upper bound on copies removed for one rule, in case `-D` never makes
/// `-C` fail.
const MAX_LIVE_COPIES: usize = 64;

/// Keeps persisted forwards and live `iptables` rules in step.
pub struct NatManager {
    store: RuleStore,
    executor: Arc<dyn CommandExecutor>,
    iptables: String,
    timeout: Duration,
    lock_timeout: Duration,
    guard: Mutex<()>,
}

impl NatManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(
        store: RuleStore,
        executor: Arc<dyn CommandExecutor>,
        iptables: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            iptables: iptables.into(),
            timeout,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            guard: Mutex::new(()),
        }
    }

    /// Sets how long operations wait for the rule directory lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Creates a manager from the `firewall` section.
    #[must_use]
    pub fn from_config(config: &ForgeConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self::new(
            RuleStore::new(&config.firewall.rules_dir),
            executor,
            config.firewall.iptables.clone(),
            config.timeouts.command(),
        )
    }

    /// Rule directory.
    #[must_use]
    pub const fn store(&self) -> &RuleStore {
        &self.store
    }

    async fn exclusive(&self) -> Result<(MutexGuard<'_, ()>, HostLock)> {
        let held = self.guard.lock().await;
        let host = HostLock::acquire(&self.store.lock_path(), self.lock_timeout).await?;
        Ok((held, host))
    }

    async fn is_live(&self, rule: &FirewallRule) -> Result<bool> {
        let spec = rule.command(RuleOp::Check, &self.iptables, self.timeout);
        let output = self.executor.run(&spec).await?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(output.check(&spec).err().unwrap_or_else(|| {
                ForgeError::external(spec.to_string(), "unexpected check result")
            })),
        }
    }

    async fn apply(&self, rule: &FirewallRule, op: RuleOp) -> Result<()> {
        let spec = rule.command(op, &self.iptables, self.timeout);
        let _ = self.executor.run_checked(&spec).await?;
        Ok(())
    }

    /// Appends `rule` unless a copy is already live.
    async fn ensure_live(&self, rule: &FirewallRule) -> Result<()> {
        if self.is_live(rule).await? {
            return Ok(());
        }
        self.apply(rule, RuleOp::Append).await
    }

    /// Deletes every live copy of `rule`. Returns how many were removed.
    async fn remove_live(&self, rule: &FirewallRule) -> Result<usize> {
        let mut removed = 0;
        while removed < MAX_LIVE_COPIES && self.is_live(rule).await? {
            self.apply(rule, RuleOp::Delete).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Persists `forward` and makes it live. Re-asserting the same forward
    /// adds no live rules.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written or `iptables`
    /// fails.
    pub async fn assert_forward(&self, forward: &NatRule) -> Result<()> {
        let _held = self.exclusive().await?;
        if let Some(previous) = self.store.load_forward(forward.external_port)? {
            if previous != *forward {
                tracing::info!(port = forward.external_port, old = %previous, "retargeting forward");
                for rule in FirewallRule::for_forward(&previous) {
                    let _ = self.remove_live(&rule).await?;
                }
            }
        }
        self.store.save_forward(forward)?;
        for rule in FirewallRule::for_forward(forward) {
            self.ensure_live(&rule).await?;
        }
        tracing::info!(forward = %forward, "forward asserted");
        Ok(())
    }

    /// Removes the forward on `external_port` from the store and the live
    /// firewall. Returns the removed forward; `None` if nothing was
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written or `iptables`
    /// fails.
    pub async fn revoke_forward(&self, external_port: u16) -> Result<Option<NatRule>> {
        let _held = self.exclusive().await?;
        let Some(forward) = self.store.remove_forward(external_port)? else {
            tracing::debug!(port = external_port, "no persisted forward to revoke");
            return Ok(None);
        };
        for rule in FirewallRule::for_forward(&forward) {
            let removed = self.remove_live(&rule).await?;
            tracing::debug!(rule = %rule, removed, "live rule removed");
        }
        tracing::info!(forward = %forward, "forward revoked");
        Ok(Some(forward))
    }

    /// Reapplies the post-apply list so exactly one copy of each entry is
    /// live. Returns the number of rules applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read or `iptables` fails.
    pub async fn reconcile(&self) -> Result<usize> {
        let _held = self.exclusive().await?;
        let mut seen: Vec<FirewallRule> = Vec::new();
        for rule in self.store.post_apply()? {
            if seen.contains(&rule) {
                continue;
            }
            let stale = self.remove_live(&rule).await?;
            self.apply(&rule, RuleOp::Append).await?;
            if stale != 1 {
                tracing::debug!(rule = %rule, stale, "live copies normalised");
            }
            seen.push(rule);
        }
        tracing::info!(rules = seen.len(), "firewall reconciled");
        Ok(seen.len())
    }

    /// Runs the pre-teardown list, removing every persisted rule from the
    /// live firewall while keeping the specifications. Returns the number
    /// of live copies removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read or `iptables` fails.
    pub async fn teardown(&self) -> Result<usize> {
        let _held = self.exclusive().await?;
        let mut removed = 0;
        for rule in self.store.pre_teardown()? {
            removed += self.remove_live(&rule).await?;
        }
        tracing::info!(removed, "firewall torn down");
        Ok(removed)
    }

    /// Every persisted forward.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn forwards(&self) -> Result<Vec<NatRule>> {
        self.store.forwards()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use vpsforge_exec::ExecOutput;
    use vpsforge_exec::recording::RecordingExecutor;

    use super::*;
    use crate::sim::IptablesSimulator;

    fn forward(port: u16, host: u8) -> NatRule {
        NatRule {
            external_port: port,
            internal_ip: Ipv4Addr::new(10, 10, 10, host),
            internal_port: 22,
        }
    }

    fn manager(dir: &std::path::Path, sim: &IptablesSimulator) -> NatManager {
        NatManager::new(
            RuleStore::new(dir),
            Arc::new(sim.clone()),
            "iptables",
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn assert_twice_adds_rules_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);

        nat.assert_forward(&forward(2222, 3)).await.unwrap();
        nat.assert_forward(&forward(2222, 3)).await.unwrap();

        assert_eq!(sim.live_count(), 2);
        assert_eq!(nat.forwards().unwrap(), vec![forward(2222, 3)]);
    }

    #[tokio::test]
    async fn revoke_removes_spec_and_every_live_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);
        nat.assert_forward(&forward(2222, 3)).await.unwrap();
        let [dnat, _] = FirewallRule::for_forward(&forward(2222, 3));
        sim.inject(&dnat);

        let revoked = nat.revoke_forward(2222).await.unwrap();
        assert_eq!(revoked, Some(forward(2222, 3)));
        assert_eq!(sim.live_count(), 0);
        assert!(nat.forwards().unwrap().is_empty());
        assert_eq!(nat.revoke_forward(2222).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reconcile_twice_leaves_one_rule_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);
        for (port, host) in [(2000, 3), (2001, 4), (2002, 5)] {
            nat.assert_forward(&forward(port, host)).await.unwrap();
        }
        let persisted = nat.store().post_apply().unwrap().len();
        assert_eq!(persisted, 6);

        sim.flush();
        assert_eq!(nat.reconcile().await.unwrap(), persisted);
        assert_eq!(sim.live_count(), persisted);

        assert_eq!(nat.reconcile().await.unwrap(), persisted);
        assert_eq!(sim.live_count(), persisted);
    }

    #[tokio::test]
    async fn reconcile_collapses_duplicated_live_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);
        nat.assert_forward(&forward(2000, 3)).await.unwrap();
        let [dnat, accept] = FirewallRule::for_forward(&forward(2000, 3));
        sim.inject(&dnat);
        sim.inject(&dnat);

        let _ = nat.reconcile().await.unwrap();
        assert_eq!(sim.copies_of(&dnat), 1);
        assert_eq!(sim.copies_of(&accept), 1);
    }

    #[tokio::test]
    async fn retargeting_a_port_drops_the_old_live_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);
        nat.assert_forward(&forward(2000, 3)).await.unwrap();
        nat.assert_forward(&forward(2000, 7)).await.unwrap();

        let [old_dnat, _] = FirewallRule::for_forward(&forward(2000, 3));
        assert_eq!(sim.copies_of(&old_dnat), 0);
        assert_eq!(sim.live_count(), 2);
    }

    #[tokio::test]
    async fn teardown_clears_live_state_but_keeps_specs() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim);
        nat.assert_forward(&forward(2000, 3)).await.unwrap();
        nat.assert_forward(&forward(2001, 4)).await.unwrap();

        assert_eq!(nat.teardown().await.unwrap(), 4);
        assert_eq!(sim.live_count(), 0);
        assert_eq!(nat.forwards().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn managers_sharing_a_directory_keep_every_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let mut tasks = tokio::task::JoinSet::new();
        for batch in 0..4u16 {
            let nat = manager(tmp.path(), &sim);
            let _ = tasks.spawn(async move {
                for n in 0..5 {
                    let port = 2000 + batch * 5 + n;
                    let host = u8::try_from(port - 1990).unwrap();
                    nat.assert_forward(&forward(port, host)).await.unwrap();
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let nat = manager(tmp.path(), &sim);
        assert_eq!(nat.forwards().unwrap().len(), 20);
        assert_eq!(nat.store().post_apply().unwrap().len(), 40);
        assert_eq!(nat.store().pre_teardown().unwrap().len(), 40);
        assert_eq!(sim.live_count(), 40);
    }

    #[tokio::test]
    async fn held_directory_lock_times_out_before_any_change() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        let nat = manager(tmp.path(), &sim).with_lock_timeout(Duration::from_millis(50));
        let _other = HostLock::try_acquire(&nat.store().lock_path())
            .unwrap()
            .unwrap();

        let err = nat.assert_forward(&forward(2000, 3)).await.unwrap_err();
        assert!(matches!(err, ForgeError::Timeout { .. }), "{err}");
        assert!(nat.forwards().unwrap().is_empty());
        assert_eq!(sim.live_count(), 0);
    }

    #[tokio::test]
    async fn append_failure_is_external_but_spec_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let sim = IptablesSimulator::new();
        sim.fail_appends("iptables: Resource temporarily unavailable.");
        let nat = manager(tmp.path(), &sim);

        let err = nat.assert_forward(&forward(2000, 3)).await.unwrap_err();
        assert!(err.is_external());
        assert_eq!(nat.forwards().unwrap(), vec![forward(2000, 3)]);
    }

    #[tokio::test]
    async fn unexpected_check_exit_code_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = RecordingExecutor::new();
        exec.respond_when(" -C ", ExecOutput::failed(2, "iptables v1.8.9: unknown option"));
        let nat = NatManager::new(
            RuleStore::new(tmp.path()),
            Arc::new(exec.clone()),
            "/usr/sbin/iptables",
            Duration::from_secs(5),
        );

        let err = nat.assert_forward(&forward(2000, 3)).await.unwrap_err();
        assert!(err.to_string().contains("unknown option"), "{err}");
        assert_eq!(exec.count_matching("/usr/sbin/iptables"), 1);
        assert_eq!(exec.count_matching(" -A "), 0);
    }
}
