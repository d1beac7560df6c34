//! End-to-end tests for the vpsforge orchestrator.
//!
//! Every scenario runs the whole [`Forge`] against in-memory stand-ins:
//! the fake hypervisor, the iptables simulator, and a temporary rule and
//! profile directory. No real host is touched.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use vpsforge_common::config::ForgeConfig;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::{ContainerId, ContainerStatus, OwnerId, PowerState, ProvisionStep};
use vpsforge_hypervisor::InstanceStatus;
use vpsforge_hypervisor::fake::{FakeHypervisor, FakeOp, HypervisorCall};
use vpsforge_net::NatManager;
use vpsforge_net::sim::IptablesSimulator;
use vpsforge_runtime::notify::{AuditEvent, AuditKind, Notifier};
use vpsforge_runtime::state::{JsonStateStore, MemoryStateStore, RecordFilter, StateStore};
use vpsforge_runtime::{CreateRequest, DeleteRequest, Forge};

#[derive(Default)]
struct CollectingNotifier {
    events: Mutex<Vec<AuditEvent>>,
}

impl CollectingNotifier {
    fn kinds(&self) -> Vec<AuditKind> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

fn host_config(dir: &std::path::Path) -> Arc<ForgeConfig> {
    let mut config = ForgeConfig::default();
    config.state_file = dir.join("state.json");
    config.firewall.rules_dir = dir.join("nat");
    config.firewall.profile_dir = dir.join("firewall");
    config.reclaim_grace_secs = 3600;
    std::fs::create_dir_all(&config.firewall.profile_dir).unwrap();
    std::fs::write(
        config.firewall.profile_dir.join("baseline.fw"),
        "[OPTIONS]\nenable: 1\npolicy_in: DROP\n",
    )
    .unwrap();
    Arc::new(config)
}

struct Host {
    tmp: tempfile::TempDir,
    config: Arc<ForgeConfig>,
    store: Arc<dyn StateStore>,
    hv: FakeHypervisor,
    sim: IptablesSimulator,
    notifier: Arc<CollectingNotifier>,
    forge: Arc<Forge>,
}

impl Host {
    fn new() -> Self {
        Self::with_store(|_| Arc::new(MemoryStateStore::new()))
    }

    fn with_store(store: impl FnOnce(&std::path::Path) -> Arc<dyn StateStore>) -> Self {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let config = host_config(tmp.path());

        let store = store(tmp.path());
        let hv = FakeHypervisor::new();
        let sim = IptablesSimulator::new();
        let nat = Arc::new(NatManager::from_config(&config, Arc::new(sim.clone())));
        let notifier = Arc::new(CollectingNotifier::default());
        let forge = Forge::with_parts(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::new(hv.clone()),
            nat,
            notifier.clone(),
        )
        .expect("should assemble forge");

        Self {
            tmp,
            config,
            store,
            hv,
            sim,
            notifier,
            forge: Arc::new(forge),
        }
    }

    fn profile(&self, id: ContainerId) -> std::path::PathBuf {
        self.config.firewall.profile_dir.join(format!("{id}.fw"))
    }
}

fn request(name: &str, owner: &str) -> CreateRequest {
    CreateRequest {
        name: name.into(),
        owner: OwnerId::new(owner),
        plan: "basic".into(),
        template: "alpine".into(),
    }
}

fn delete(id: ContainerId, owner: &str) -> DeleteRequest {
    DeleteRequest {
        id,
        owner: OwnerId::new(owner),
        confirm: true,
    }
}

// ── Allocation ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_creates_get_distinct_identifiers() {
    let host = Host::new();
    host.hv.set_create_delay(Duration::from_millis(5));

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..12 {
        let forge = Arc::clone(&host.forge);
        let _ = tasks.spawn(async move { forge.create(request(&format!("box{n}"), "alice")).await });
    }
    let mut records = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        records.push(joined.unwrap().expect("create should succeed"));
    }

    let ids: BTreeSet<_> = records.iter().map(|r| r.id).collect();
    let ips: BTreeSet<_> = records.iter().map(|r| r.network.private_ip).collect();
    let ports: BTreeSet<_> = records.iter().map(|r| r.network.ssh_port).collect();
    assert_eq!(ids.len(), 12);
    assert_eq!(ips.len(), 12);
    assert_eq!(ports.len(), 12);
    assert_eq!(ids.first().map(|id| id.get()), Some(100));
    assert_eq!(host.sim.live_count(), 24);
}

#[tokio::test]
async fn deleted_identifiers_are_handed_out_again() {
    let host = Host::new();
    let first = host.forge.create(request("one", "alice")).await.unwrap();
    let _ = host.forge.delete(&delete(first.id, "alice")).await.unwrap();

    let second = host.forge.create(request("two", "alice")).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.network.private_ip, first.network.private_ip);
    assert_ne!(second.key, first.key);
    assert_eq!(host.forge.list_all().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn orchestrators_sharing_a_state_file_never_collide() {
    let tmp = tempfile::tempdir().unwrap();
    let config = host_config(tmp.path());
    let hv = FakeHypervisor::new();
    hv.set_create_delay(Duration::from_millis(5));
    let sim = IptablesSimulator::new();
    let forges: Vec<Arc<Forge>> = (0..2)
        .map(|_| {
            let nat = Arc::new(NatManager::from_config(&config, Arc::new(sim.clone())));
            let forge = Forge::with_parts(
                Arc::clone(&config),
                Arc::new(JsonStateStore::new(&config.state_file)),
                Arc::new(hv.clone()),
                nat,
                Arc::new(CollectingNotifier::default()),
            )
            .unwrap();
            Arc::new(forge)
        })
        .collect();

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..6 {
        let forge = Arc::clone(&forges[n % 2]);
        let _ = tasks.spawn(async move { forge.create(request(&format!("box{n}"), "alice")).await });
    }
    while let Some(joined) = tasks.join_next().await {
        let _ = joined.unwrap().expect("create should succeed");
    }

    let stored = JsonStateStore::new(&config.state_file)
        .find(&RecordFilter::all())
        .await
        .unwrap();
    let ids: BTreeSet<_> = stored.iter().map(|r| r.id).collect();
    let ips: BTreeSet<_> = stored.iter().map(|r| r.network.private_ip).collect();
    let ports: BTreeSet<_> = stored.iter().map(|r| r.network.ssh_port).collect();
    assert_eq!(stored.len(), 6);
    assert_eq!((ids.len(), ips.len(), ports.len()), (6, 6, 6));
    assert!(stored.iter().all(|r| r.status() == ContainerStatus::Active));
    assert_eq!(sim.live_count(), 12);
}

#[test]
fn standard_plan_is_deterministic() {
    let host = Host::new();
    for _ in 0..3 {
        let plan = host.config.plan("standard").unwrap();
        assert_eq!(
            (plan.memory_mb, plan.cpu_cores, plan.disk_gb),
            (1024, 2, 20)
        );
    }
}

// ── Provisioning ─────────────────────────────────────────────────────

#[tokio::test]
async fn create_produces_reachable_container() {
    let host = Host::new();
    let record = host.forge.create(request("web", "alice")).await.unwrap();

    assert_eq!(record.status(), ContainerStatus::Active);
    assert_eq!(record.power, PowerState::Running);
    assert_eq!(host.hv.instance(record.id), InstanceStatus::Running);
    assert!(host.profile(record.id).exists());

    let scripts = host.hv.scripts(record.id);
    assert!(scripts[0].contains("apk update"));
    assert!(scripts.iter().any(|s| s.contains("rc-update add sshd")));

    let dnat = format!(
        "-t nat -A PREROUTING -p tcp --dport {} -j DNAT --to-destination {}:22",
        record.network.ssh_port, record.network.private_ip
    );
    assert!(host.sim.live().iter().any(|l| l.contains(&dnat)), "{:?}", host.sim.live());

    let listed = host.forge.list(&OwnerId::new("alice")).await.unwrap();
    assert_eq!(listed, vec![record]);
}

#[tokio::test]
async fn create_failure_leaves_error_record_without_later_effects() {
    let host = Host::new();
    host.hv.fail(FakeOp::Create, "storage 'local' is full");

    let err = host.forge.create(request("web", "alice")).await.unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Provisioning {
            step: ProvisionStep::Create,
            ..
        }
    ));

    let stored = host.store.find(&RecordFilter::live()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status(), ContainerStatus::Error);
    assert!(!host.profile(stored[0].id).exists());
    assert!(host.hv.scripts(stored[0].id).is_empty());
    assert_eq!(host.sim.live_count(), 0);
    assert!(host.sim.calls().is_empty());
}

#[tokio::test]
async fn unknown_plan_is_rejected_before_any_effect() {
    let host = Host::new();
    let mut req = request("web", "alice");
    req.plan = "enterprise".into();

    let err = host.forge.create(req).await.unwrap_err();
    assert!(err.is_rejection());
    assert!(host.store.find(&RecordFilter::all()).await.unwrap().is_empty());
    assert!(host.hv.calls().is_empty());
}

#[tokio::test]
async fn precheck_collision_never_destroys_the_existing_instance() {
    let host = Host::new();
    host.hv.add_foreign_instance(ContainerId::new(100));

    let err = host.forge.create(request("web", "alice")).await.unwrap_err();
    assert!(matches!(
        err,
        ForgeError::Provisioning {
            step: ProvisionStep::Precheck,
            ..
        }
    ));

    let _ = host.forge.delete(&delete(ContainerId::new(100), "alice")).await.unwrap();
    assert_eq!(host.hv.instance(ContainerId::new(100)), InstanceStatus::Running);
    assert!(
        !host
            .hv
            .calls()
            .iter()
            .any(|c| matches!(c, HypervisorCall::Create(_) | HypervisorCall::Destroy(_)))
    );
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn start_and_stop_follow_power_state_and_ownership() {
    let host = Host::new();
    let record = host.forge.create(request("web", "alice")).await.unwrap();
    let alice = OwnerId::new("alice");

    assert!(matches!(
        host.forge.start(record.id, &alice).await.unwrap_err(),
        ForgeError::InvalidState { .. }
    ));
    assert!(matches!(
        host.forge.stop(record.id, &OwnerId::new("bob")).await.unwrap_err(),
        ForgeError::Authorization { .. }
    ));

    let stopped = host.forge.stop(record.id, &alice).await.unwrap();
    assert_eq!(stopped.power, PowerState::Stopped);
    let started = host.forge.start(record.id, &alice).await.unwrap();
    assert_eq!(started.power, PowerState::Running);
}

#[tokio::test]
async fn delete_of_unknown_id_is_not_found_and_mutates_nothing() {
    let host = Host::new();
    let record = host.forge.create(request("web", "alice")).await.unwrap();
    let before = host.store.find(&RecordFilter::all()).await.unwrap();
    let calls = host.hv.calls().len();

    let err = host
        .forge
        .delete(&delete(ContainerId::new(999), "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeError::NotFound { .. }));
    assert_eq!(host.store.find(&RecordFilter::all()).await.unwrap(), before);
    assert_eq!(host.hv.calls().len(), calls);
    assert_eq!(host.sim.live_count(), 2);
    assert!(host.profile(record.id).exists());
}

#[tokio::test]
async fn delete_purges_instance_forward_and_profile() {
    let host = Host::new();
    let record = host.forge.create(request("web", "alice")).await.unwrap();

    let deleted = host.forge.delete(&delete(record.id, "alice")).await.unwrap();
    assert_eq!(deleted.status(), ContainerStatus::Deleted);
    assert!(deleted.expiry.is_some());
    assert_eq!(host.hv.instance(record.id), InstanceStatus::Missing);
    assert_eq!(host.sim.live_count(), 0);
    assert!(!host.profile(record.id).exists());
    assert!(host.forge.list(&OwnerId::new("alice")).await.unwrap().is_empty());
    assert_eq!(host.notifier.kinds(), [AuditKind::Deleted]);
}

// ── Firewall ─────────────────────────────────────────────────────────

#[tokio::test]
async fn reconcile_twice_keeps_one_live_copy_per_rule() {
    let host = Host::new();
    for n in 0..3 {
        let _ = host.forge.create(request(&format!("box{n}"), "alice")).await.unwrap();
    }
    assert_eq!(host.sim.live_count(), 6);

    host.sim.flush();
    assert_eq!(host.forge.reconcile().await.unwrap(), 6);
    assert_eq!(host.sim.live_count(), 6);
    let _ = host.forge.reconcile().await.unwrap();
    assert_eq!(host.sim.live_count(), 6);
}

#[tokio::test]
async fn firewall_teardown_removes_every_forward() {
    let host = Host::new();
    let _ = host.forge.create(request("web", "alice")).await.unwrap();
    assert_eq!(host.forge.teardown_firewall().await.unwrap(), 2);
    assert_eq!(host.sim.live_count(), 0);
}

// ── Reclaim ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reclaim_releases_failed_records_after_grace() {
    let host = Host::new();
    host.hv.fail_exec_when("apk add", "ERROR: unable to select packages");
    let _ = host.forge.create(request("web", "alice")).await.unwrap_err();
    let failed = host.store.find(&RecordFilter::live()).await.unwrap().remove(0);
    assert_eq!(host.hv.instance(failed.id), InstanceStatus::Running);

    let report = host.forge.reclaim(Utc::now()).await.unwrap();
    assert!(report.reclaimed.is_empty());
    assert_eq!(report.waiting, 1);

    let later = Utc::now() + TimeDelta::hours(2);
    let report = host.forge.reclaim(later).await.unwrap();
    assert_eq!(report.reclaimed, vec![failed.id]);
    assert_eq!(host.hv.instance(failed.id), InstanceStatus::Missing);
    assert!(!host.profile(failed.id).exists());
    assert!(host.store.find(&RecordFilter::live()).await.unwrap().is_empty());
    assert_eq!(host.notifier.kinds(), [AuditKind::Reclaimed]);
}

#[tokio::test]
async fn delete_racing_reclaim_purges_and_reports_once() {
    let host = Host::new();
    host.hv.fail_exec_when("apk add", "ERROR: unable to select packages");
    let _ = host.forge.create(request("web", "alice")).await.unwrap_err();
    let failed = host.store.find(&RecordFilter::live()).await.unwrap().remove(0);

    let later = Utc::now() + TimeDelta::hours(2);
    let delete_request = delete(failed.id, "alice");
    let (deleted, report) = tokio::join!(
        host.forge.delete(&delete_request),
        host.forge.reclaim(later)
    );

    let report = report.unwrap();
    assert_eq!(usize::from(deleted.is_ok()) + report.reclaimed.len(), 1);
    let destroys = host
        .hv
        .calls()
        .iter()
        .filter(|c| **c == HypervisorCall::Destroy(failed.id))
        .count();
    assert_eq!(destroys, 1);
    assert_eq!(host.notifier.kinds().len(), 1);
    let all = host.store.find(&RecordFilter::all()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status(), ContainerStatus::Deleted);
}

// ── Persistence ──────────────────────────────────────────────────────

#[tokio::test]
async fn records_survive_in_the_json_state_file() {
    let host = Host::with_store(|dir| Arc::new(JsonStateStore::new(dir.join("state.json"))));
    let record = host.forge.create(request("web", "alice")).await.unwrap();

    let reopened = JsonStateStore::new(host.tmp.path().join("state.json"));
    let stored = reopened
        .find_one(&RecordFilter::by_id(record.id))
        .await
        .unwrap()
        .expect("record should be persisted");
    assert_eq!(stored, record);
    assert_eq!(stored.credential().expose(), record.credential().expose());
}
