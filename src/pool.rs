//! Pool management for pre-warmed workspaces
//!
//! Each (template, OS) pool keeps a queue of ready, unassigned workspaces
//! inside a `[min, max]` band. Replenishment requests new pool-origin
//! workspaces through the resilient client; the band's upper bound follows
//! recent demand up to an absolute ceiling.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;

use crate::audit::AuditLedger;
use crate::clock::SharedClock;
use crate::config::{EngineConfig, PoolSpec};
use crate::control_plane::{CreateRequest, RemoteStatus, ResilientClient};
use crate::models::{
    AuditRecord, AuditResult, InFlight, PoolKey, PoolRecord, PoolStatus, WorkspaceInstance, WorkspaceState,
};
use crate::store::Store;
use crate::{Error, Result};

const ACTOR: &str = "pool-manager";

/// Outcome of one replenishment pass over a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplenishReport {
    pub key: Option<PoolKey>,
    /// Ready count the pass aimed for
    pub target: usize,
    pub max: usize,
    /// `(from, to)` when demand moved `max`
    pub resized: Option<(usize, usize)>,
    /// Warming workspaces that became ready
    pub promoted: usize,
    /// Creation requests issued
    pub requested: usize,
    pub failed: usize,
    /// Ready workspaces released after `max` shrank
    pub trimmed: usize,
    /// Ready entries whose workspace had left the pool
    pub dropped: usize,
    /// Another pass was already running
    pub skipped: bool,
}

struct SlotState {
    record: PoolRecord,
    /// Assignment timestamps inside the demand window
    recent: VecDeque<DateTime<Utc>>,
}

impl SlotState {
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while self.recent.front().is_some_and(|t| *t <= now - window) {
            self.recent.pop_front();
        }
    }

    fn recent_demand(&self, now: DateTime<Utc>, window: chrono::Duration) -> usize {
        self.recent.iter().filter(|t| **t > now - window).count()
    }
}

struct PoolSlot {
    state: Mutex<SlotState>,
    replenishing: AtomicBool,
}

/// Clears the replenishing flag when a pass ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Warmth {
    Ready,
    Warming,
    Lost,
}

/// Manages the warm pools
pub struct PoolManager {
    store: Arc<dyn Store>,
    client: Arc<ResilientClient>,
    ledger: Arc<AuditLedger>,
    clock: SharedClock,
    region: String,
    auto_stop_minutes: u32,
    max_lifetime: chrono::Duration,
    demand_window: chrono::Duration,
    pools: RwLock<BTreeMap<PoolKey, Arc<PoolSlot>>>,
}

impl PoolManager {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<ResilientClient>,
        ledger: Arc<AuditLedger>,
        clock: SharedClock,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            client,
            ledger,
            clock,
            region: config.regions.default_region.clone(),
            auto_stop_minutes: config.lifecycle.default_auto_stop_minutes,
            max_lifetime: chrono::Duration::days(i64::from(config.lifecycle.default_max_lifetime_days)),
            demand_window: chrono::Duration::minutes(i64::from(config.pools.demand_window_minutes)),
            pools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a pool, or update the band of a registered one.
    ///
    /// Persisted queues are picked up so a restart keeps its warm capacity.
    pub fn register(&self, spec: &PoolSpec) -> Result<()> {
        if spec.min > spec.max || spec.max > spec.ceiling {
            return Err(Error::Config(format!(
                "pool {}: expected min <= max <= ceiling, got {} / {} / {}",
                spec.key(),
                spec.min,
                spec.max,
                spec.ceiling
            )));
        }
        let key = spec.key();
        let now = self.clock.now();

        if let Some(slot) = self.slot(&key) {
            let mut state = slot.state.lock();
            apply_band(&mut state.record, spec, now);
            self.store.upsert_pool(&state.record)?;
            tracing::info!(pool = %key, min = spec.min, max = state.record.max, "Pool band updated");
            return Ok(());
        }

        let mut record = self
            .store
            .get_pool(&key)?
            .unwrap_or_else(|| PoolRecord::new(key.clone(), spec.min, spec.max, spec.ceiling, now));
        apply_band(&mut record, spec, now);
        self.store.upsert_pool(&record)?;
        tracing::info!(pool = %key, min = record.min, max = record.max, ready = record.ready.len(), "Pool registered");

        self.pools.write().entry(key).or_insert_with(|| {
            Arc::new(PoolSlot {
                state: Mutex::new(SlotState {
                    record,
                    recent: VecDeque::new(),
                }),
                replenishing: AtomicBool::new(false),
            })
        });
        Ok(())
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        self.pools.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &PoolKey) -> bool {
        self.pools.read().contains_key(key)
    }

    /// Take a ready workspace for assignment.
    ///
    /// The returned workspace is claimed (`in_flight` set); the caller must
    /// clear the claim when it finishes. Every call counts as demand, hit or
    /// miss. Unregistered pools always miss.
    pub fn dequeue(&self, key: &PoolKey) -> Result<Option<WorkspaceInstance>> {
        let Some(slot) = self.slot(key) else {
            return Ok(None);
        };
        let now = self.clock.now();
        let mut state = slot.state.lock();
        state.prune(now, self.demand_window);
        state.recent.push_back(now);
        state.record.demand += 1;

        let mut claimed = None;
        while !state.record.ready.is_empty() {
            let id = state.record.ready.remove(0);
            let stored = match self.store.get_instance(&id) {
                Ok(stored) => stored,
                Err(e) => {
                    state.record.ready.insert(0, id);
                    return Err(e);
                }
            };
            match stored {
                Some(ws) if ws.is_unassigned_in_pool() && !ws.is_busy() => {
                    if let Some(ws) = self.store.try_claim(&id, "assign", now)? {
                        claimed = Some(ws);
                        break;
                    }
                    tracing::debug!(pool = %key, instance = %id, "Pooled workspace busy, skipping");
                }
                _ => tracing::debug!(pool = %key, instance = %id, "Dropping stale pool entry"),
            }
        }

        state.record.updated_at = now;
        self.store.upsert_pool(&state.record)?;
        match &claimed {
            Some(ws) => tracing::info!(pool = %key, instance = %ws.id, "Workspace taken from pool"),
            None => tracing::info!(pool = %key, "Pool empty"),
        }
        Ok(claimed)
    }

    /// Put a dequeued workspace back at the head of its pool
    pub fn requeue(&self, ws: &WorkspaceInstance) -> Result<()> {
        let key = ws.pool_key();
        let slot = self.slot(&key).ok_or_else(|| Error::PoolNotFound(key.to_string()))?;
        let mut state = slot.state.lock();
        if !state.record.ready.contains(&ws.id) {
            state.record.ready.insert(0, ws.id.clone());
        }
        state.record.updated_at = self.clock.now();
        self.store.upsert_pool(&state.record)
    }

    /// Replenish every registered pool; failures are logged and skipped
    pub fn replenish_all(&self) -> Vec<ReplenishReport> {
        let mut reports = Vec::new();
        for key in self.keys() {
            match self.replenish(&key) {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(pool = %key, error = %e, "Pool replenishment failed"),
            }
        }
        reports
    }

    /// One replenishment pass.
    ///
    /// Warming workspaces are promoted first, then the pool is filled to
    /// `clamp(recent_demand, min, max)` counting warming workspaces against
    /// the deficit. No pool lock is held across control-plane calls.
    pub fn replenish(&self, key: &PoolKey) -> Result<ReplenishReport> {
        let slot = self.slot(key).ok_or_else(|| Error::PoolNotFound(key.to_string()))?;
        if slot.replenishing.swap(true, Ordering::AcqRel) {
            tracing::debug!(pool = %key, "Replenishment already running");
            return Ok(ReplenishReport {
                key: Some(key.clone()),
                skipped: true,
                ..Default::default()
            });
        }
        let _pass = PassGuard(&slot.replenishing);

        let now = self.clock.now();
        let mut report = ReplenishReport {
            key: Some(key.clone()),
            ..Default::default()
        };

        let warming = {
            let mut state = slot.state.lock();
            state.prune(now, self.demand_window);
            report.resized = resize(&mut state, now, self.demand_window);
            if report.resized.is_some() {
                self.store.upsert_pool(&state.record)?;
            }
            state.record.warming.clone()
        };
        if let Some((from, to)) = report.resized {
            tracing::info!(pool = %key, from, to, "Pool max resized by demand");
            self.ledger.append(
                AuditRecord::new(ACTOR, "pool.resize", "pool", key.to_string(), AuditResult::Success)
                    .details(json!({ "from": from, "to": to })),
            )?;
        }

        let mut ready_now = Vec::new();
        let mut lost = Vec::new();
        for id in &warming {
            match self.check_warming(id) {
                Ok(Warmth::Ready) => ready_now.push(id.clone()),
                Ok(Warmth::Lost) => lost.push(id.clone()),
                Ok(Warmth::Warming) => {}
                Err(e) => tracing::warn!(pool = %key, instance = %id, error = %e, "Could not check warming workspace"),
            }
        }
        report.promoted = ready_now.len();

        let (deficit, excess) = {
            let mut state = slot.state.lock();
            let record = &mut state.record;
            record.warming.retain(|id| !ready_now.contains(id) && !lost.contains(id));
            for id in ready_now {
                if !record.ready.contains(&id) {
                    record.ready.push(id);
                }
            }
            report.dropped = self.drop_dead_ready(key, &mut record.ready)?;

            let recent = state.recent_demand(now, self.demand_window);
            let record = &mut state.record;
            let target = recent.clamp(record.min, record.max);
            let have = record.ready.len() + record.warming.len();
            let deficit = target.saturating_sub(have);
            let excess_count = record.ready.len().saturating_sub(record.max);
            let excess = record.ready.split_off(record.ready.len() - excess_count);

            report.target = target;
            report.max = record.max;
            record.updated_at = now;
            self.store.upsert_pool(record)?;
            (deficit, excess)
        };

        let mut filled_ready = Vec::new();
        let mut filled_warming = Vec::new();
        for _ in 0..deficit {
            report.requested += 1;
            match self.fill_one(key, now) {
                Ok(ws) if ws.state == WorkspaceState::Available => filled_ready.push(ws.id),
                Ok(ws) => filled_warming.push(ws.id),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(pool = %key, error = %e, "Pool fill failed; retrying next sweep");
                    if matches!(e, Error::CircuitOpen { .. }) {
                        break;
                    }
                }
            }
        }

        for id in &excess {
            match self.retire(key, id) {
                Ok(()) => report.trimmed += 1,
                Err(e) => tracing::warn!(pool = %key, instance = %id, error = %e, "Could not release surplus workspace"),
            }
        }

        if !filled_ready.is_empty() || !filled_warming.is_empty() {
            let mut state = slot.state.lock();
            state.record.ready.extend(filled_ready);
            state.record.warming.extend(filled_warming);
            state.record.updated_at = self.clock.now();
            self.store.upsert_pool(&state.record)?;
        }

        tracing::info!(
            pool = %key,
            target = report.target,
            requested = report.requested,
            promoted = report.promoted,
            failed = report.failed,
            trimmed = report.trimmed,
            "Pool replenished"
        );
        Ok(report)
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let now = self.clock.now();
        let slots: Vec<_> = self.pools.read().values().cloned().collect();
        slots
            .iter()
            .map(|slot| {
                let state = slot.state.lock();
                pool_status(&state, now, self.demand_window)
            })
            .collect()
    }

    pub fn status_of(&self, key: &PoolKey) -> Result<PoolStatus> {
        let slot = self.slot(key).ok_or_else(|| Error::PoolNotFound(key.to_string()))?;
        let state = slot.state.lock();
        Ok(pool_status(&state, self.clock.now(), self.demand_window))
    }

    fn slot(&self, key: &PoolKey) -> Option<Arc<PoolSlot>> {
        self.pools.read().get(key).cloned()
    }

    /// Forget ready ids whose workspace was terminated or handed out elsewhere
    fn drop_dead_ready(&self, key: &PoolKey, ready: &mut Vec<String>) -> Result<usize> {
        let before = ready.len();
        let mut live = Vec::with_capacity(before);
        for id in ready.drain(..) {
            match self.store.get_instance(&id)? {
                Some(ws) if ws.is_unassigned_in_pool() => live.push(id),
                _ => tracing::debug!(pool = %key, instance = %id, "Dropping stale pool entry"),
            }
        }
        let dropped = before - live.len();
        *ready = live;
        Ok(dropped)
    }

    fn check_warming(&self, id: &str) -> Result<Warmth> {
        let Some(ws) = self.store.get_instance(id)? else {
            return Ok(Warmth::Lost);
        };
        match ws.state {
            WorkspaceState::Available if ws.is_unassigned_in_pool() => return Ok(Warmth::Ready),
            WorkspaceState::Pending => {}
            _ => return Ok(Warmth::Lost),
        }

        let Some(mut ws) = self.store.try_claim(id, "promote", self.clock.now())? else {
            return Ok(Warmth::Warming);
        };
        let remote = match self.client.describe(&ws) {
            Ok(remote) => remote,
            Err(e) => {
                self.store.release_claim(id)?;
                return Err(e);
            }
        };

        let outcome = match remote.status {
            RemoteStatus::Available => {
                ws.state = WorkspaceState::Available;
                Warmth::Ready
            }
            RemoteStatus::Error | RemoteStatus::Terminating | RemoteStatus::Terminated => {
                ws.state = WorkspaceState::Terminated;
                Warmth::Lost
            }
            _ => Warmth::Warming,
        };
        ws.in_flight = None;
        ws.updated_at = self.clock.now();
        self.store.update_instance(&ws)?;

        match outcome {
            Warmth::Ready => {
                self.ledger.append(
                    AuditRecord::workspace(ACTOR, "workspace.ready", &ws.id, AuditResult::Success)
                        .details(json!({ "pool": ws.pool_key().to_string(), "remote_status": remote.status })),
                )?;
            }
            Warmth::Lost => {
                tracing::warn!(instance = %ws.id, status = ?remote.status, "Warming workspace lost");
                self.ledger.append(
                    AuditRecord::workspace(ACTOR, "workspace.ready", &ws.id, AuditResult::Failure)
                        .details(json!({ "pool": ws.pool_key().to_string(), "remote_status": remote.status })),
                )?;
            }
            Warmth::Warming => {}
        }
        Ok(outcome)
    }

    fn fill_one(&self, key: &PoolKey, now: DateTime<Utc>) -> Result<WorkspaceInstance> {
        let mut ws = WorkspaceInstance::new(&key.template_id, key.os, &self.region, now, self.max_lifetime)
            .with_pool_origin(true)
            .with_auto_stop_minutes(self.auto_stop_minutes);
        ws.in_flight = Some(InFlight {
            action: "create".into(),
            since: now,
        });
        self.store.insert_instance(&ws)?;

        let handle = self.ledger.open_transition(
            ACTOR,
            "pool.fill",
            &ws.id,
            json!({ "pool": key.to_string(), "region": ws.region }),
        )?;
        let request = CreateRequest::new(&ws.id, &key.template_id, key.os, &ws.region)
            .pool_origin(true)
            .tag("pool", key.to_string());

        let result = self.client.create(&request);
        ws.in_flight = None;
        ws.updated_at = self.clock.now();
        match result {
            Ok(remote) => {
                ws.remote_id = Some(remote.remote_id.clone());
                if remote.status == RemoteStatus::Available {
                    ws.state = WorkspaceState::Available;
                }
                self.store.update_instance(&ws)?;
                self.ledger.close_transition(
                    handle,
                    AuditResult::Success,
                    json!({ "remote_id": remote.remote_id, "state": ws.state }),
                )?;
                tracing::info!(pool = %key, instance = %ws.id, state = %ws.state, "Pool workspace created");
                Ok(ws)
            }
            Err(e) => {
                ws.state = WorkspaceState::Terminated;
                self.store.update_instance(&ws)?;
                self.ledger.close_transition(
                    handle,
                    AuditResult::Failure,
                    json!({ "error_kind": e.kind(), "error": e.to_string() }),
                )?;
                Err(e)
            }
        }
    }

    /// Terminate a surplus ready workspace
    fn retire(&self, key: &PoolKey, id: &str) -> Result<()> {
        let Some(mut ws) = self.store.try_claim(id, "retire", self.clock.now())? else {
            return Err(Error::InstanceBusy(id.to_string()));
        };
        let handle = self.ledger.open_transition(
            ACTOR,
            "pool.trim",
            id,
            json!({ "pool": key.to_string(), "from": ws.state }),
        )?;
        match self.client.terminate(&ws) {
            Ok(remote) => {
                ws.state = match remote.status {
                    RemoteStatus::Terminated => WorkspaceState::Terminated,
                    _ => WorkspaceState::Terminating,
                };
                ws.in_flight = None;
                ws.updated_at = self.clock.now();
                self.store.update_instance(&ws)?;
                self.ledger
                    .close_transition(handle, AuditResult::Success, json!({ "to": ws.state }))?;
                Ok(())
            }
            Err(e) => {
                self.store.release_claim(id)?;
                self.ledger.close_transition(
                    handle,
                    AuditResult::Failure,
                    json!({ "error_kind": e.kind(), "error": e.to_string() }),
                )?;
                Err(e)
            }
        }
    }
}

fn apply_band(record: &mut PoolRecord, spec: &PoolSpec, now: DateTime<Utc>) {
    record.min = spec.min;
    record.base_max = spec.max;
    record.ceiling = spec.ceiling;
    record.max = record.max.clamp(spec.max, spec.ceiling);
    record.updated_at = now;
}

/// Move `max` with demand: grow to the recent rate when it exceeds `max`,
/// shrink back toward the configured value once demand halves.
fn resize(state: &mut SlotState, now: DateTime<Utc>, window: chrono::Duration) -> Option<(usize, usize)> {
    let recent = state.recent_demand(now, window);
    let record = &mut state.record;
    let from = record.max;
    if recent > record.max && record.max < record.ceiling {
        record.max = recent.min(record.ceiling);
    } else if recent * 2 < record.max && record.max > record.base_max {
        record.max = recent.max(record.base_max);
    }
    (record.max != from).then_some((from, record.max))
}

fn pool_status(state: &SlotState, now: DateTime<Utc>, window: chrono::Duration) -> PoolStatus {
    let r = &state.record;
    PoolStatus {
        key: r.key.clone(),
        min: r.min,
        max: r.max,
        ceiling: r.ceiling,
        ready: r.ready.len(),
        warming: r.warming.len(),
        recent_demand: state.recent_demand(now, window),
        total_demand: r.demand,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CircuitConfig;
    use crate::control_plane::{CircuitBreaker, RetryPolicy};
    use crate::mock::{Failure, Op, SimulatedControlPlane};
    use crate::models::OperatingSystem;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    struct Fixture {
        pools: Arc<PoolManager>,
        cp: Arc<SimulatedControlPlane>,
        clock: ManualClock,
        store: MemoryStore,
        ledger: Arc<AuditLedger>,
    }

    fn fixture(cp: SimulatedControlPlane) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = MemoryStore::new();
        let ledger = Arc::new(AuditLedger::new(Arc::new(store.clone()), shared.clone()));
        let cp = Arc::new(cp);
        let client = Arc::new(ResilientClient::new(
            cp.clone(),
            CircuitBreaker::new("control-plane", CircuitConfig::default(), shared.clone()),
            RetryPolicy::default(),
            shared.clone(),
            ledger.clone(),
        ));
        let pools = Arc::new(PoolManager::new(
            Arc::new(store.clone()),
            client,
            ledger.clone(),
            shared,
            &EngineConfig::default(),
        ));
        Fixture {
            pools,
            cp,
            clock,
            store,
            ledger,
        }
    }

    fn key() -> PoolKey {
        PoolKey::new("bundle-std", OperatingSystem::Windows)
    }

    fn spec() -> PoolSpec {
        PoolSpec::new("bundle-std", OperatingSystem::Windows)
    }

    #[test]
    fn test_replenish_creates_exactly_the_deficit() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(20)).unwrap();
        f.pools.replenish(&key()).unwrap();
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 2);
        assert_eq!(f.cp.calls(Op::Create), 2);

        f.pools.register(&spec().min(5).max(20)).unwrap();
        let report = f.pools.replenish(&key()).unwrap();

        assert_eq!(report.requested, 3);
        assert_eq!(f.cp.calls(Op::Create), 5);
        let status = f.pools.status_of(&key()).unwrap();
        assert_eq!(status.ready, 5);
        assert_eq!(status.min, 5);
        assert_eq!(status.max, 20);
    }

    #[test]
    fn test_full_pool_requests_nothing() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(3).max(5)).unwrap();
        f.pools.replenish(&key()).unwrap();
        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.requested, 0);
        assert_eq!(f.cp.calls(Op::Create), 3);
    }

    #[test]
    fn test_warming_counts_against_deficit_then_promotes() {
        let f = fixture(SimulatedControlPlane::new().with_ready_after(1));
        f.pools.register(&spec().min(3).max(5)).unwrap();

        f.pools.replenish(&key()).unwrap();
        let status = f.pools.status_of(&key()).unwrap();
        assert_eq!((status.ready, status.warming), (0, 3));

        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.promoted, 3);
        assert_eq!(report.requested, 0);
        let status = f.pools.status_of(&key()).unwrap();
        assert_eq!((status.ready, status.warming), (3, 0));
        assert_eq!(f.cp.calls(Op::Create), 3);
    }

    #[test]
    fn test_concurrent_dequeue_never_double_issues() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(10).max(10)).unwrap();
        f.pools.replenish(&key()).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pools = Arc::clone(&f.pools);
                std::thread::spawn(move || pools.dequeue(&key()).unwrap().map(|ws| ws.id))
            })
            .collect();
        let taken: Vec<String> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();

        assert_eq!(taken.len(), 10);
        assert_eq!(taken.iter().collect::<HashSet<_>>().len(), 10);
        assert_eq!(f.pools.status_of(&key()).unwrap().total_demand, 16);
    }

    #[test]
    fn test_dequeue_skips_entries_no_longer_pooled() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(2)).unwrap();
        f.pools.replenish(&key()).unwrap();

        let first = f.store.list_instances().unwrap().remove(0);
        let mut gone = first.clone();
        gone.state = WorkspaceState::Terminated;
        f.store.update_instance(&gone).unwrap();

        let taken = f.pools.dequeue(&key()).unwrap().unwrap();
        assert_ne!(taken.id, first.id);
        assert!(taken.is_busy());
        assert!(f.pools.dequeue(&key()).unwrap().is_none());
    }

    #[test]
    fn test_terminated_ready_workspace_is_replaced() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(4)).unwrap();
        f.pools.replenish(&key()).unwrap();
        assert_eq!(f.cp.calls(Op::Create), 2);

        let mut gone = f.store.list_instances().unwrap().remove(0);
        gone.state = WorkspaceState::Terminated;
        f.store.update_instance(&gone).unwrap();

        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.requested, 1);
        assert_eq!(f.cp.calls(Op::Create), 3);

        let live_ready = f
            .store
            .list_instances()
            .unwrap()
            .into_iter()
            .filter(|ws| ws.is_unassigned_in_pool())
            .count();
        assert_eq!(live_ready, 2);
        let status = f.pools.status_of(&key()).unwrap();
        assert_eq!(status.ready, 2);
        assert!(!f.store.get_pool(&key()).unwrap().unwrap().ready.contains(&gone.id));
    }

    #[test]
    fn test_idle_pool_fills_to_exactly_min() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(3).max(10).ceiling(20)).unwrap();

        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.target, 3);
        assert_eq!(report.requested, 3);

        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.requested, 0);
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 3);
        assert_eq!(f.cp.calls(Op::Create), 3);
    }

    #[test]
    fn test_failed_fill_is_retried_next_sweep() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(4)).unwrap();
        f.cp.fail_next(Op::Create, 5, Failure::Transient);

        let report = f.pools.replenish(&key()).unwrap();
        assert!(report.failed >= 1);
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 0);

        f.clock.advance(chrono::Duration::seconds(30));
        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 2);
    }

    #[test]
    fn test_demand_raises_max_then_shrinks() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(1).max(2).ceiling(5)).unwrap();

        for _ in 0..4 {
            assert!(f.pools.dequeue(&key()).unwrap().is_none());
        }
        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.resized, Some((2, 4)));
        assert_eq!(report.requested, 4);
        assert_eq!(f.pools.status_of(&key()).unwrap().ready, 4);

        f.clock.advance(chrono::Duration::hours(2));
        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.resized, Some((4, 2)));
        assert_eq!(report.trimmed, 2);
        assert_eq!(f.cp.calls(Op::Terminate), 2);
        let status = f.pools.status_of(&key()).unwrap();
        assert_eq!((status.ready, status.max), (2, 2));
    }

    #[test]
    fn test_demand_growth_bounded_by_ceiling() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(0).max(1).ceiling(3)).unwrap();
        for _ in 0..10 {
            let _ = f.pools.dequeue(&key()).unwrap();
        }
        let report = f.pools.replenish(&key()).unwrap();
        assert_eq!(report.max, 3);
        assert_eq!(report.requested, 3);
    }

    #[test]
    fn test_fills_are_audited_as_complete_transitions() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(2)).unwrap();
        f.pools.replenish(&key()).unwrap();

        let entries = f.ledger.entries(1..=100).unwrap();
        let fills: Vec<_> = entries.iter().filter(|e| e.action == "pool.fill").collect();
        assert_eq!(fills.len(), 4);
        assert!(f.ledger.incomplete_transitions().unwrap().is_empty());
        assert!(f.ledger.verify_all().unwrap().valid);
    }

    #[test]
    fn test_unknown_pool() {
        let f = fixture(SimulatedControlPlane::new());
        assert!(matches!(f.pools.replenish(&key()), Err(Error::PoolNotFound(_))));
        assert!(f.pools.dequeue(&key()).unwrap().is_none());
        assert!(f.pools.register(&spec().min(4).max(2)).is_err());
    }

    #[test]
    fn test_register_restores_persisted_queue() {
        let f = fixture(SimulatedControlPlane::new());
        f.pools.register(&spec().min(2).max(3)).unwrap();
        f.pools.replenish(&key()).unwrap();

        let shared: SharedClock = Arc::new(f.clock.clone());
        let client = Arc::new(ResilientClient::new(
            f.cp.clone(),
            CircuitBreaker::new("control-plane", CircuitConfig::default(), shared.clone()),
            RetryPolicy::none(),
            shared.clone(),
            f.ledger.clone(),
        ));
        let restarted = PoolManager::new(Arc::new(f.store.clone()), client, f.ledger.clone(), shared, &EngineConfig::default());
        restarted.register(&spec().min(2).max(3)).unwrap();
        assert_eq!(restarted.status_of(&key()).unwrap().ready, 2);
    }
}
