//! Engine facade and background workers
//!
//! [`Engine`] wires the store, ledger, resilient client, pools, assignment
//! service, lifecycle manager and monitor together. [`Workers`] runs the
//! periodic pool, lifecycle and monitor passes on tokio intervals.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::assignment::{Assignment, AssignmentRequest, Customizer, PoolAssignmentService};
use crate::audit::AuditLedger;
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::control_plane::{CircuitBreaker, ControlPlane, ResilientClient, RetryPolicy};
use crate::directory::{DirectoryJoiner, DirectoryService, NoopDirectory};
use crate::lifecycle::{LifecycleManager, LogNotifier, Notifier, SweepReport};
use crate::mock::SimulatedControlPlane;
use crate::models::{AuditEntry, AuditRecord, AuditResult, WorkspaceState};
use crate::monitor::{MetricsSink, ProvisioningMonitor, TracingMetricsSink};
use crate::pool::{PoolManager, ReplenishReport};
use crate::region::{GeoLocator, RegionSelector};
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::Result;

const ACTOR: &str = "engine";

/// Builder for [`Engine`]; every collaborator has an in-process default
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    clock: Option<SharedClock>,
    directory: Option<Arc<dyn DirectoryService>>,
    notifier: Option<Arc<dyn Notifier>>,
    locator: Option<Arc<dyn GeoLocator>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            control_plane: None,
            clock: None,
            directory: None,
            notifier: None,
            locator: None,
            metrics: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn locator(mut self, locator: Arc<dyn GeoLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the config, wire the components and register configured pools
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock: SharedClock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let control_plane = self
            .control_plane
            .unwrap_or_else(|| Arc::new(SimulatedControlPlane::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(TracingMetricsSink));

        let ledger = Arc::new(AuditLedger::new(store.clone(), clock.clone()));
        let breaker = CircuitBreaker::new("control-plane", config.circuit.clone(), clock.clone())
            .with_metrics(metrics.clone());
        let client = Arc::new(ResilientClient::new(
            control_plane,
            breaker,
            RetryPolicy::from(&config.retry),
            clock.clone(),
            ledger.clone(),
        ));

        let pools = Arc::new(PoolManager::new(
            store.clone(),
            client.clone(),
            ledger.clone(),
            clock.clone(),
            &config,
        ));
        for spec in &config.pools.pools {
            pools.register(spec)?;
        }

        let mut selector = RegionSelector::from_config(&config.regions);
        if let Some(locator) = self.locator {
            selector = selector.with_locator(locator);
        }
        let selector = Arc::new(selector);

        let monitor = Arc::new(ProvisioningMonitor::new(config.monitor.clone(), clock.clone(), metrics));
        let directory = self.directory.unwrap_or_else(|| Arc::new(NoopDirectory));
        let customizer = Arc::new(Customizer::new(DirectoryJoiner::new(
            directory,
            &config.directory,
            clock.clone(),
        )));

        let assignment = Arc::new(PoolAssignmentService::new(
            store.clone(),
            pools.clone(),
            selector.clone(),
            client.clone(),
            ledger.clone(),
            monitor.clone(),
            customizer.clone(),
            clock.clone(),
            &config,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            client.clone(),
            ledger.clone(),
            clock.clone(),
            self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            customizer,
            &config.lifecycle,
        ));

        tracing::info!(
            pools = config.pools.pools.len(),
            default_region = %config.regions.default_region,
            "Engine ready"
        );

        Ok(Engine {
            config,
            store,
            clock,
            ledger,
            client,
            pools,
            selector,
            monitor,
            assignment,
            lifecycle,
        })
    }
}

/// One combined pool and lifecycle pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub pools: Vec<ReplenishReport>,
    pub lifecycle: SweepReport,
}

/// What [`Engine::recover`] found and settled
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Transitions that had an intent record but no outcome
    pub interrupted: Vec<AuditEntry>,
    /// Workspaces whose stale in-flight marker was cleared
    pub released: Vec<String>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    clock: SharedClock,
    ledger: Arc<AuditLedger>,
    client: Arc<ResilientClient>,
    pools: Arc<PoolManager>,
    selector: Arc<RegionSelector>,
    monitor: Arc<ProvisioningMonitor>,
    assignment: Arc<PoolAssignmentService>,
    lifecycle: Arc<LifecycleManager>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// In-memory engine against the simulated control plane
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Engine persisting to a SQLite database at `path`
    pub fn with_sqlite(config: EngineConfig, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let store = SqliteStore::open(path)?;
        EngineBuilder::new(config).store(Arc::new(store)).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn selector(&self) -> &Arc<RegionSelector> {
        &self.selector
    }

    pub fn monitor(&self) -> &Arc<ProvisioningMonitor> {
        &self.monitor
    }

    pub fn assignment(&self) -> &Arc<PoolAssignmentService> {
        &self.assignment
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn assign(&self, request: &AssignmentRequest) -> Result<Assignment> {
        self.assignment.assign_request(request)
    }

    /// Replenish every pool, then run one lifecycle sweep
    pub fn sweep(&self) -> Result<SweepOutcome> {
        let pools = self.pools.replenish_all();
        let lifecycle = self.lifecycle.sweep()?;
        Ok(SweepOutcome { pools, lifecycle })
    }

    /// Settle what a previous process left behind.
    ///
    /// Call before starting workers. Interrupted transitions found by ledger
    /// replay get a FAILURE outcome under their correlation id. In-flight
    /// markers still set are cleared; a workspace whose creation never
    /// returned a control-plane id is marked terminated.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            interrupted: self.ledger.incomplete_transitions()?,
            released: Vec::new(),
        };

        for entry in &report.interrupted {
            tracing::warn!(
                seq = entry.seq,
                action = %entry.action,
                subject = %entry.subject_id,
                "Interrupted transition found in ledger"
            );
            self.ledger.append(
                AuditRecord::new(ACTOR, &entry.action, &entry.subject_type, &entry.subject_id, AuditResult::Failure)
                    .correlation(&entry.correlation_id)
                    .details(json!({ "error_kind": "interrupted", "initiated_seq": entry.seq })),
            )?;
        }

        for mut ws in self.store.list_instances()? {
            let Some(in_flight) = ws.in_flight.take() else {
                continue;
            };
            if ws.state == WorkspaceState::Pending && ws.remote_id.is_none() {
                ws.state = WorkspaceState::Terminated;
            }
            ws.updated_at = self.clock.now();
            self.store.update_instance(&ws)?;
            self.ledger.append(
                AuditRecord::workspace(ACTOR, "workspace.recover", &ws.id, AuditResult::Success)
                    .details(json!({ "interrupted_action": in_flight.action, "state": ws.state })),
            )?;
            tracing::warn!(instance = %ws.id, action = %in_flight.action, state = %ws.state, "Released stale claim");
            report.released.push(ws.id);
        }

        Ok(report)
    }
}

/// Handles to the periodic background tasks
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Start the pool, lifecycle and monitor workers on the current runtime
    pub fn spawn(engine: Arc<Engine>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let config = engine.config();
        let pool_every = Duration::from_secs(config.pools.sweep_interval_secs.max(1));
        let lifecycle_every = Duration::from_secs(config.lifecycle.sweep_interval_secs.max(1));
        let monitor_every = Duration::from_secs(config.monitor.emit_interval_secs.max(1));

        let pools = engine.pools.clone();
        let lifecycle = engine.lifecycle.clone();
        let monitor = engine.monitor.clone();

        let handles = vec![
            spawn_periodic("pool-replenish", pool_every, rx.clone(), move || {
                pools.replenish_all();
            }),
            spawn_periodic("lifecycle-sweep", lifecycle_every, rx.clone(), move || {
                if let Err(e) = lifecycle.sweep() {
                    tracing::error!(error = %e, "Lifecycle sweep failed");
                }
            }),
            spawn_periodic("monitor-emit", monitor_every, rx, move || monitor.emit()),
        ];

        tracing::info!(workers = handles.len(), "Background workers started");
        Self { shutdown, handles }
    }

    /// Signal every worker and wait for the running passes to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    }
}

fn spawn_periodic(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    task: impl Fn() + Send + Sync + 'static,
) -> JoinHandle<()> {
    let task = Arc::new(task);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let task = task.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                        tracing::error!(worker = name, error = %e, "Worker pass panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = name, "Worker stopped");
    })
}
