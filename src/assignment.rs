//! Workspace assignment: pooled fast path with on-demand fallback

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::audit::{AuditLedger, OpenTransition};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::control_plane::{CreateRequest, RemoteStatus, ResilientClient};
use crate::directory::DirectoryJoiner;
use crate::models::{AuditResult, Customization, InFlight, OperatingSystem, PoolKey, WorkspaceInstance, WorkspaceState};
use crate::monitor::ProvisioningMonitor;
use crate::pool::PoolManager;
use crate::region::{CallerLocation, RegionSelector};
use crate::store::Store;
use crate::{Error, Result};

const ACTOR: &str = "assignment-service";

/// How an assignment was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPath {
    Pooled,
    OnDemand,
}

impl AssignmentPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentPath::Pooled => "pooled",
            AssignmentPath::OnDemand => "on_demand",
        }
    }
}

impl std::fmt::Display for AssignmentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRequest {
    pub template_id: String,
    pub os: OperatingSystem,
    pub user: String,
    pub customization: Customization,
    pub caller: CallerLocation,
}

impl AssignmentRequest {
    pub fn new(template_id: impl Into<String>, os: OperatingSystem, user: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            os,
            user: user.into(),
            customization: Customization::default(),
            caller: CallerLocation::Unknown,
        }
    }

    pub fn customization(mut self, customization: Customization) -> Self {
        self.customization = customization;
        self
    }

    pub fn caller(mut self, caller: CallerLocation) -> Self {
        self.caller = caller;
        self
    }
}

/// A workspace handed to a user
#[derive(Debug, Clone)]
pub struct Assignment {
    pub workspace: WorkspaceInstance,
    pub path: AssignmentPath,
    /// Request to available
    pub duration: Duration,
}

/// Applies per-requester customization to a workspace
pub struct Customizer {
    joiner: DirectoryJoiner,
}

impl Customizer {
    pub fn new(joiner: DirectoryJoiner) -> Self {
        Self { joiner }
    }

    pub fn apply(&self, ws: &mut WorkspaceInstance, customization: &Customization) -> Result<()> {
        if let Some(tag) = &customization.region_tag {
            ws.metadata.insert("region_tag".into(), tag.clone());
        }
        for (key, value) in &customization.metadata {
            ws.metadata.insert(key.clone(), value.clone());
        }
        if customization.join_directory {
            let remote_id = ws
                .remote_id
                .clone()
                .ok_or_else(|| Error::Permanent(format!("workspace {} has no control-plane id", ws.id)))?;
            self.joiner.join(&ws.id, &remote_id)?;
            ws.metadata.insert("directory_joined".into(), "true".into());
        }
        Ok(())
    }
}

pub struct PoolAssignmentService {
    store: Arc<dyn Store>,
    pools: Arc<PoolManager>,
    selector: Arc<RegionSelector>,
    client: Arc<ResilientClient>,
    ledger: Arc<AuditLedger>,
    monitor: Arc<ProvisioningMonitor>,
    customizer: Arc<Customizer>,
    clock: SharedClock,
    poll_interval: Duration,
    ready_timeout: Duration,
    auto_stop_minutes: u32,
    max_lifetime: chrono::Duration,
}

impl PoolAssignmentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        pools: Arc<PoolManager>,
        selector: Arc<RegionSelector>,
        client: Arc<ResilientClient>,
        ledger: Arc<AuditLedger>,
        monitor: Arc<ProvisioningMonitor>,
        customizer: Arc<Customizer>,
        clock: SharedClock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            pools,
            selector,
            client,
            ledger,
            monitor,
            customizer,
            clock,
            poll_interval: Duration::from_millis(config.provisioning.poll_interval_ms),
            ready_timeout: Duration::from_secs(config.provisioning.ready_timeout_secs),
            auto_stop_minutes: config.lifecycle.default_auto_stop_minutes,
            max_lifetime: chrono::Duration::days(i64::from(config.lifecycle.default_max_lifetime_days)),
        }
    }

    pub fn assign(
        &self,
        template_id: &str,
        os: OperatingSystem,
        user: &str,
        customization: Customization,
    ) -> Result<Assignment> {
        self.assign_request(&AssignmentRequest::new(template_id, os, user).customization(customization))
    }

    /// Serve from the matching pool, or create on demand when it is empty
    pub fn assign_request(&self, request: &AssignmentRequest) -> Result<Assignment> {
        let span = self.monitor.begin();
        let key = PoolKey::new(&request.template_id, request.os);

        let pooled = match self.pools.dequeue(&key) {
            Ok(pooled) => pooled,
            Err(e) => {
                tracing::warn!(pool = %key, error = %e, "Pool unavailable, creating on demand");
                None
            }
        };
        let (path, result) = match pooled {
            Some(ws) => (AssignmentPath::Pooled, self.assign_pooled(ws, request)),
            None => (AssignmentPath::OnDemand, self.assign_on_demand(request)),
        };

        let workspace_id = result.as_ref().ok().map(|ws| ws.id.clone());
        let duration = self
            .monitor
            .complete(&span, path.as_str(), workspace_id.as_deref(), result.is_ok());
        let workspace = result?;
        Ok(Assignment {
            workspace,
            path,
            duration,
        })
    }

    /// Run an assignment on the blocking pool.
    ///
    /// Dropping the returned handle detaches the task: provisioning runs to
    /// completion and is audited either way.
    pub fn assign_detached(self: &Arc<Self>, request: AssignmentRequest) -> tokio::task::JoinHandle<Result<Assignment>> {
        let service = Arc::clone(self);
        tokio::task::spawn_blocking(move || service.assign_request(&request))
    }

    fn assign_pooled(&self, mut ws: WorkspaceInstance, request: &AssignmentRequest) -> Result<WorkspaceInstance> {
        let handle = match self.ledger.open_transition(
            ACTOR,
            "workspace.assign",
            &ws.id,
            json!({
                "path": AssignmentPath::Pooled.as_str(),
                "user": request.user,
                "template_id": request.template_id,
                "os": request.os,
            }),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.store.release_claim(&ws.id)?;
                self.pools.requeue(&ws)?;
                return Err(e);
            }
        };

        ws.owner = Some(request.user.clone());
        ws.last_connected_at = Some(self.clock.now());
        self.finish(ws, handle, request, AssignmentPath::Pooled)
    }

    fn assign_on_demand(&self, request: &AssignmentRequest) -> Result<WorkspaceInstance> {
        let now = self.clock.now();
        let region = self.selector.select(&request.caller);
        let mut ws = WorkspaceInstance::new(&request.template_id, request.os, &region.code, now, self.max_lifetime)
            .with_owner(&request.user)
            .with_auto_stop_minutes(self.auto_stop_minutes);
        ws.last_connected_at = Some(now);
        ws.in_flight = Some(InFlight {
            action: "create".into(),
            since: now,
        });

        let handle = self.ledger.open_transition(
            ACTOR,
            "workspace.assign",
            &ws.id,
            json!({
                "path": AssignmentPath::OnDemand.as_str(),
                "user": request.user,
                "template_id": request.template_id,
                "os": request.os,
                "region": region.code,
                "region_fallback": region.fallback,
            }),
        )?;
        if let Err(e) = self.store.insert_instance(&ws) {
            self.close_failed(handle, AssignmentPath::OnDemand, &e, None);
            return Err(e);
        }

        let create = CreateRequest::new(&ws.id, &ws.template_id, ws.os, &ws.region).user(&request.user);
        let remote = match self.client.create(&create) {
            Ok(remote) => remote,
            Err(e) => return Err(self.abandon(ws, handle, WorkspaceState::Terminated, None, e)),
        };
        ws.remote_id = Some(remote.remote_id.clone());
        ws.updated_at = self.clock.now();
        self.store.update_instance(&ws)?;
        tracing::info!(instance = %ws.id, remote = %remote.remote_id, region = %ws.region, "Workspace requested on demand");

        if let Err(e) = self.wait_until_ready(&ws, remote.status) {
            let pending = Some(request.customization.clone());
            return Err(self.abandon(ws, handle, WorkspaceState::Pending, pending, e));
        }
        self.finish(ws, handle, request, AssignmentPath::OnDemand)
    }

    /// Poll until the control plane reports the workspace available
    fn wait_until_ready(&self, ws: &WorkspaceInstance, initial: RemoteStatus) -> Result<()> {
        let started = self.clock.now();
        let timeout = chrono::Duration::from_std(self.ready_timeout).unwrap_or(chrono::Duration::MAX);
        let mut status = initial;
        loop {
            match status {
                RemoteStatus::Available => return Ok(()),
                RemoteStatus::Pending | RemoteStatus::Starting => {}
                other => {
                    return Err(Error::Permanent(format!(
                        "workspace {} reported {other:?} while provisioning",
                        ws.id
                    )))
                }
            }
            let waited = self.clock.now() - started;
            if waited >= timeout {
                return Err(Error::ProvisioningTimeout {
                    instance_id: ws.id.clone(),
                    waited_secs: waited.num_seconds().max(0) as u64,
                });
            }
            self.clock.sleep(self.poll_interval);
            status = match self.client.describe(ws) {
                Ok(remote) => remote.status,
                Err(e @ (Error::Transient(_) | Error::CircuitOpen { .. })) => {
                    tracing::debug!(instance = %ws.id, error = %e, "Describe failed while waiting, polling again");
                    status
                }
                Err(e) => return Err(e),
            };
        }
    }

    /// Customize, bind and release a claimed workspace
    fn finish(
        &self,
        mut ws: WorkspaceInstance,
        handle: OpenTransition,
        request: &AssignmentRequest,
        path: AssignmentPath,
    ) -> Result<WorkspaceInstance> {
        if let Err(e) = self.customizer.apply(&mut ws, &request.customization) {
            tracing::warn!(instance = %ws.id, error = %e, "Customization failed; left pending for the next sweep");
            let partial = Error::PartialFailure {
                instance_id: ws.id.clone(),
                step: "customization".into(),
                cause: e.to_string(),
            };
            let pending = Some(request.customization.clone());
            return Err(self.abandon(ws, handle, WorkspaceState::Pending, pending, partial));
        }

        ws.state = WorkspaceState::Available;
        ws.pending_customization = None;
        ws.in_flight = None;
        ws.updated_at = self.clock.now();
        self.store.update_instance(&ws)?;
        self.ledger.close_transition(
            handle,
            AuditResult::Success,
            json!({
                "path": path.as_str(),
                "user": request.user,
                "region": ws.region,
                "remote_id": ws.remote_id,
            }),
        )?;
        tracing::info!(instance = %ws.id, user = %request.user, path = %path, "Workspace assigned");
        Ok(ws)
    }

    /// Release the claim in `state`, audit the failure and hand back `error`
    fn abandon(
        &self,
        mut ws: WorkspaceInstance,
        handle: OpenTransition,
        state: WorkspaceState,
        pending: Option<Customization>,
        error: Error,
    ) -> Error {
        let path = if ws.pool_origin {
            AssignmentPath::Pooled
        } else {
            AssignmentPath::OnDemand
        };
        ws.state = state;
        ws.in_flight = None;
        ws.pending_customization = pending;
        ws.updated_at = self.clock.now();
        if let Err(e) = self.store.update_instance(&ws) {
            tracing::error!(instance = %ws.id, error = %e, "Failed to persist abandoned assignment");
        }
        self.close_failed(handle, path, &error, Some(state));
        tracing::error!(instance = %ws.id, state = %state, error = %error, "Assignment failed");
        error
    }

    fn close_failed(&self, handle: OpenTransition, path: AssignmentPath, error: &Error, state: Option<WorkspaceState>) {
        let details = json!({
            "path": path.as_str(),
            "error_kind": error.kind(),
            "error": error.to_string(),
            "state": state,
        });
        if let Err(e) = self.ledger.close_transition(handle, AuditResult::Failure, details) {
            tracing::error!(error = %e, "Failed to audit assignment failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitConfig, DirectoryConfig, MonitorConfig, PoolSpec};
    use crate::control_plane::{CircuitBreaker, RetryPolicy};
    use crate::directory::{DirectoryService, JoinStatus, MockDirectoryService, NoopDirectory};
    use crate::mock::{Failure, Op, SimulatedControlPlane};
    use crate::models::Coordinates;
    use crate::monitor::TracingMetricsSink;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    struct Fixture {
        service: Arc<PoolAssignmentService>,
        pools: Arc<PoolManager>,
        cp: Arc<SimulatedControlPlane>,
        clock: ManualClock,
        store: MemoryStore,
        ledger: Arc<AuditLedger>,
        monitor: Arc<ProvisioningMonitor>,
    }

    fn fixture_with(cp: SimulatedControlPlane, config: EngineConfig, directory: Arc<dyn DirectoryService>) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = MemoryStore::new();
        let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
        let ledger = Arc::new(AuditLedger::new(dyn_store.clone(), shared.clone()));
        let cp = Arc::new(cp);
        let client = Arc::new(ResilientClient::new(
            cp.clone(),
            CircuitBreaker::new("control-plane", CircuitConfig::default(), shared.clone()),
            RetryPolicy::default(),
            shared.clone(),
            ledger.clone(),
        ));
        let pools = Arc::new(PoolManager::new(
            dyn_store.clone(),
            client.clone(),
            ledger.clone(),
            shared.clone(),
            &config,
        ));
        for spec in &config.pools.pools {
            pools.register(spec).unwrap();
        }
        let monitor = Arc::new(ProvisioningMonitor::new(
            MonitorConfig::default(),
            shared.clone(),
            Arc::new(TracingMetricsSink),
        ));
        let joiner = DirectoryJoiner::new(directory, &DirectoryConfig::default(), shared.clone());
        let service = Arc::new(PoolAssignmentService::new(
            dyn_store,
            pools.clone(),
            Arc::new(RegionSelector::from_config(&config.regions)),
            client,
            ledger.clone(),
            monitor.clone(),
            Arc::new(Customizer::new(joiner)),
            shared,
            &config,
        ));
        Fixture {
            service,
            pools,
            cp,
            clock,
            store,
            ledger,
            monitor,
        }
    }

    fn fixture(cp: SimulatedControlPlane, config: EngineConfig) -> Fixture {
        fixture_with(cp, config, Arc::new(NoopDirectory))
    }

    fn pooled_config(min: usize) -> EngineConfig {
        EngineConfig::new().pool(PoolSpec::new("bundle-std", OperatingSystem::Windows).min(min).max(10))
    }

    fn key() -> PoolKey {
        PoolKey::new("bundle-std", OperatingSystem::Windows)
    }

    fn assign_success(f: &Fixture) -> Vec<crate::models::AuditEntry> {
        f.ledger
            .entries(1..=1_000)
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "workspace.assign" && e.result == AuditResult::Success)
            .collect()
    }

    #[test]
    fn test_pooled_fast_path() {
        let f = fixture(SimulatedControlPlane::new(), pooled_config(2));
        f.pools.replenish(&key()).unwrap();
        let creates = f.cp.calls(Op::Create);

        let assignment = f
            .service
            .assign("bundle-std", OperatingSystem::Windows, "alice", Customization::new().meta("team", "qa"))
            .unwrap();

        assert_eq!(assignment.path, AssignmentPath::Pooled);
        assert_eq!(f.cp.calls(Op::Create), creates);
        let ws = f.store.get_instance(&assignment.workspace.id).unwrap().unwrap();
        assert_eq!(ws.owner.as_deref(), Some("alice"));
        assert_eq!(ws.state, WorkspaceState::Available);
        assert!(!ws.is_busy());
        assert_eq!(ws.metadata.get("team").map(String::as_str), Some("qa"));
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 1);

        let entries = assign_success(&f);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["path"], "pooled");
    }

    #[test]
    fn test_empty_pool_creates_exactly_once_on_demand() {
        let f = fixture(SimulatedControlPlane::new(), pooled_config(0));

        let assignment = f
            .service
            .assign("bundle-std", OperatingSystem::Windows, "bob", Customization::new())
            .unwrap();

        assert_eq!(assignment.path, AssignmentPath::OnDemand);
        assert_eq!(f.cp.calls(Op::Create), 1);
        let entries = assign_success(&f);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["path"], "on_demand");
        assert_eq!(entries[0].subject_id, assignment.workspace.id);
        assert!(f.ledger.incomplete_transitions().unwrap().is_empty());
        assert_eq!(f.monitor.snapshot().completed, 1);
    }

    #[test]
    fn test_on_demand_polls_until_ready() {
        let f = fixture(SimulatedControlPlane::new().with_ready_after(3), EngineConfig::new());

        let assignment = f
            .service
            .assign("bundle-gpu", OperatingSystem::Linux, "carol", Customization::new())
            .unwrap();

        assert_eq!(f.cp.calls(Op::Describe), 3);
        assert_eq!(f.clock.total_slept(), Duration::from_secs(6));
        assert_eq!(assignment.duration, Duration::from_secs(6));
        assert_eq!(assignment.workspace.state, WorkspaceState::Available);
    }

    #[test]
    fn test_region_follows_caller() {
        let f = fixture(SimulatedControlPlane::new(), EngineConfig::new());
        let request = AssignmentRequest::new("bundle-std", OperatingSystem::Linux, "dave")
            .caller(CallerLocation::Coordinates(Coordinates::new(1.3, 103.8)));

        let assignment = f.service.assign_request(&request).unwrap();
        assert_eq!(assignment.workspace.region, "ap-southeast-1");
    }

    #[test]
    fn test_ready_timeout_leaves_workspace_pending() {
        let mut config = EngineConfig::new();
        config.provisioning.ready_timeout_secs = 10;
        let f = fixture(SimulatedControlPlane::new().with_ready_after(100), config);

        let err = f
            .service
            .assign("bundle-std", OperatingSystem::Linux, "erin", Customization::new())
            .unwrap_err();
        assert!(matches!(err, Error::ProvisioningTimeout { .. }));

        let ws = f.store.list_instances().unwrap().remove(0);
        assert_eq!(ws.state, WorkspaceState::Pending);
        assert!(!ws.is_busy());
        assert!(ws.remote_id.is_some());
        assert!(f.ledger.incomplete_transitions().unwrap().is_empty());
    }

    #[test]
    fn test_customization_failure_is_partial() {
        let mut directory = MockDirectoryService::new();
        directory
            .expect_request_join()
            .returning(|_, _| Ok(JoinStatus::Failed("domain controller unreachable".into())));
        let f = fixture_with(SimulatedControlPlane::new(), EngineConfig::new(), Arc::new(directory));

        let err = f
            .service
            .assign("bundle-std", OperatingSystem::Windows, "frank", Customization::new().join_directory(true))
            .unwrap_err();

        let Error::PartialFailure { instance_id, step, .. } = err else {
            panic!("expected partial failure");
        };
        assert_eq!(step, "customization");
        let ws = f.store.get_instance(&instance_id).unwrap().unwrap();
        assert_eq!(ws.state, WorkspaceState::Pending);
        assert_eq!(ws.owner.as_deref(), Some("frank"));
        assert!(ws.pending_customization.is_some());

        let failure = f.ledger.entries_for_subject(&instance_id).unwrap().pop().unwrap();
        assert_eq!(failure.result, AuditResult::Failure);
        assert_eq!(failure.details["error_kind"], "partial_failure");
    }

    #[test]
    fn test_create_failure_surfaces_and_is_audited() {
        let f = fixture(SimulatedControlPlane::new(), EngineConfig::new());
        f.cp.fail_next(Op::Create, 1, Failure::Permanent);

        let err = f
            .service
            .assign("bundle-std", OperatingSystem::Windows, "gina", Customization::new())
            .unwrap_err();
        assert!(matches!(err, Error::Permanent(_)));

        let ws = f.store.list_instances().unwrap().remove(0);
        assert_eq!(ws.state, WorkspaceState::Terminated);
        let failures: Vec<_> = f
            .ledger
            .entries(1..=100)
            .unwrap()
            .into_iter()
            .filter(|e| e.result == AuditResult::Failure)
            .collect();
        assert_eq!(failures.len(), 2);
        assert_eq!(f.monitor.snapshot().succeeded, 0);
    }

    #[test]
    fn test_concurrent_assignments_get_distinct_workspaces() {
        let f = fixture(SimulatedControlPlane::new(), pooled_config(3));
        f.pools.replenish(&key()).unwrap();

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let service = Arc::clone(&f.service);
                std::thread::spawn(move || {
                    service
                        .assign("bundle-std", OperatingSystem::Windows, &format!("user-{i}"), Customization::new())
                        .unwrap()
                })
            })
            .collect();
        let assignments: Vec<Assignment> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ids: HashSet<_> = assignments.iter().map(|a| a.workspace.id.clone()).collect();
        assert_eq!(ids.len(), 6);
        let pooled = assignments.iter().filter(|a| a.path == AssignmentPath::Pooled).count();
        assert_eq!(pooled, 3);
    }

    #[tokio::test]
    async fn test_detached_assignment_completes_after_caller_leaves() {
        let f = fixture(SimulatedControlPlane::new().with_ready_after(2), EngineConfig::new());

        let awaited = f
            .service
            .assign_detached(AssignmentRequest::new("bundle-std", OperatingSystem::Linux, "henry"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(awaited.path, AssignmentPath::OnDemand);

        drop(f.service.assign_detached(AssignmentRequest::new("bundle-std", OperatingSystem::Linux, "iris")));

        let mut done = false;
        for _ in 0..200 {
            if assign_success(&f).len() == 2 {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "detached assignment never completed");
        let owners: HashSet<_> = f
            .store
            .list_instances()
            .unwrap()
            .into_iter()
            .filter_map(|ws| ws.owner)
            .collect();
        assert!(owners.contains("iris"));
    }
}
