//! In-memory hypervisor for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use vpsforge_common::error::{ForgeError, Result};
use vpsforge_common::types::ContainerId;
use vpsforge_exec::ExecOutput;

use crate::{CreateSpec, GuestCommand, Hypervisor, InstanceDescriptor, InstanceStatus, TemplateInfo};

/// Control plane operation, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FakeOp {
    /// `status`.
    Status,
    /// `create`.
    Create,
    /// `start`.
    Start,
    /// `stop`.
    Stop,
    /// `destroy`.
    Destroy,
    /// `exec`.
    Exec,
}

/// A call observed by [`FakeHypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    /// Status query.
    Status(ContainerId),
    /// Instance creation.
    Create(ContainerId),
    /// Start.
    Start(ContainerId),
    /// Stop.
    Stop(ContainerId),
    /// Destroy.
    Destroy(ContainerId),
    /// Guest command with its script.
    Exec(ContainerId, String),
    /// Template listing.
    ListTemplates,
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<ContainerId, InstanceStatus>,
    calls: Vec<HypervisorCall>,
    created: Vec<CreateSpec>,
    failures: BTreeMap<FakeOp, String>,
    exec_failures: Vec<(String, String)>,
    templates: Vec<TemplateInfo>,
    create_delay: Option<Duration>,
}

/// Hypervisor keeping instances in memory.
///
/// Clones share state, so a test keeps one handle while the code under
/// test owns another.
#[derive(Clone, Default)]
pub struct FakeHypervisor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHypervisor {
    /// Creates an empty hypervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an instance the orchestrator did not create.
    pub fn add_foreign_instance(&self, id: ContainerId) {
        self.set(id, InstanceStatus::Running);
    }

    /// Makes every call of `op` fail with `message`.
    pub fn fail(&self, op: FakeOp, message: impl Into<String>) {
        let _ = self.lock().failures.insert(op, message.into());
    }

    /// Removes an injected failure.
    pub fn heal(&self, op: FakeOp) {
        let _ = self.lock().failures.remove(&op);
    }

    /// Makes guest scripts containing `needle` exit 1 with `stderr`.
    pub fn fail_exec_when(&self, needle: impl Into<String>, stderr: impl Into<String>) {
        self.lock()
            .exec_failures
            .push((needle.into(), stderr.into()));
    }

    /// Sets the templates returned by `list_templates`.
    pub fn set_templates(&self, templates: Vec<TemplateInfo>) {
        self.lock().templates = templates;
    }

    /// Makes `create` sleep before completing.
    pub fn set_create_delay(&self, delay: Duration) {
        self.lock().create_delay = Some(delay);
    }

    /// Every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.lock().calls.clone()
    }

    /// Specs passed to successful creates.
    #[must_use]
    pub fn created(&self) -> Vec<CreateSpec> {
        self.lock().created.clone()
    }

    /// Scripts executed inside `id`, in order.
    #[must_use]
    pub fn scripts(&self, id: ContainerId) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                HypervisorCall::Exec(target, script) if *target == id => Some(script.clone()),
                _ => None,
            })
            .collect()
    }

    /// Current status of `id`.
    #[must_use]
    pub fn instance(&self, id: ContainerId) -> InstanceStatus {
        self.lock()
            .instances
            .get(&id)
            .copied()
            .unwrap_or(InstanceStatus::Missing)
    }

    /// Number of existing instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    fn begin(&self, op: FakeOp, call: HypervisorCall) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get(&op) {
            Some(message) => Err(ForgeError::external(format!("{op:?}"), message.clone())),
            None => Ok(()),
        }
    }

    fn require(&self, id: ContainerId, operation: &str) -> Result<()> {
        if self.instance(id) == InstanceStatus::Missing {
            return Err(ForgeError::external(
                operation,
                format!("CT {id} does not exist"),
            ));
        }
        Ok(())
    }

    fn set(&self, id: ContainerId, status: InstanceStatus) {
        let _ = self.lock().instances.insert(id, status);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn status(&self, id: ContainerId) -> Result<InstanceStatus> {
        self.begin(FakeOp::Status, HypervisorCall::Status(id))?;
        Ok(self.instance(id))
    }

    async fn create(&self, spec: &CreateSpec) -> Result<InstanceDescriptor> {
        self.begin(FakeOp::Create, HypervisorCall::Create(spec.id))?;
        let delay = self.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.instances.contains_key(&spec.id) {
            return Err(ForgeError::external(
                "create",
                format!("CT {} already exists", spec.id),
            ));
        }
        let status = if spec.start {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        };
        let _ = state.instances.insert(spec.id, status);
        state.created.push(spec.clone());
        Ok(InstanceDescriptor {
            id: spec.id,
            node: "fake".into(),
            hostname: spec.hostname.clone(),
        })
    }

    async fn start(&self, id: ContainerId) -> Result<()> {
        self.begin(FakeOp::Start, HypervisorCall::Start(id))?;
        self.require(id, "start")?;
        self.set(id, InstanceStatus::Running);
        Ok(())
    }

    async fn stop(&self, id: ContainerId) -> Result<()> {
        self.begin(FakeOp::Stop, HypervisorCall::Stop(id))?;
        self.require(id, "stop")?;
        self.set(id, InstanceStatus::Stopped);
        Ok(())
    }

    async fn destroy(&self, id: ContainerId) -> Result<()> {
        self.begin(FakeOp::Destroy, HypervisorCall::Destroy(id))?;
        self.require(id, "destroy")?;
        let _ = self.lock().instances.remove(&id);
        Ok(())
    }

    async fn exec(&self, id: ContainerId, command: &GuestCommand) -> Result<ExecOutput> {
        self.begin(
            FakeOp::Exec,
            HypervisorCall::Exec(id, command.script.clone()),
        )?;
        if self.instance(id) != InstanceStatus::Running {
            return Ok(ExecOutput::failed(1, format!("CT {id} not running")));
        }
        let state = self.lock();
        let failure = state
            .exec_failures
            .iter()
            .find(|(needle, _)| command.script.contains(needle.as_str()));
        Ok(failure.map_or_else(ExecOutput::default, |(_, stderr)| {
            ExecOutput::failed(1, stderr.clone())
        }))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateInfo>> {
        let mut state = self.lock();
        state.calls.push(HypervisorCall::ListTemplates);
        Ok(state.templates.clone())
    }
}
