//! Engine integration tests against the simulated control plane

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::TempDir;
use workspace_fleet::mock::{Failure, Op, SimulatedControlPlane};
use workspace_fleet::{
    AssignmentPath, AssignmentRequest, AuditLedger, AuditResult, CircuitState, Engine, EngineConfig, Error,
    ManualClock, OperatingSystem, PoolKey, PoolSpec, SqliteStore, SystemClock, WorkspaceState,
};

fn config(min: usize) -> EngineConfig {
    EngineConfig::new()
        .pool(PoolSpec::new("bundle-std", OperatingSystem::Windows).min(min).max(4).ceiling(8))
        .default_region("eu-west-1")
}

fn key() -> PoolKey {
    PoolKey::new("bundle-std", OperatingSystem::Windows)
}

fn request(user: &str) -> AssignmentRequest {
    AssignmentRequest::new("bundle-std", OperatingSystem::Windows, user)
}

fn sqlite_engine(path: &std::path::Path, clock: &ManualClock, min: usize) -> Engine {
    Engine::builder(config(min))
        .store(Arc::new(SqliteStore::open(path).unwrap()))
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

#[test]
fn test_pooled_assignment_then_idle_stop_and_restart() {
    let clock = ManualClock::starting_now();
    let engine = Engine::builder(config(1))
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();

    engine.sweep().unwrap();
    let assignment = engine.assign(&request("alice")).unwrap();
    assert_eq!(assignment.path, AssignmentPath::Pooled);
    let id = assignment.workspace.id.clone();
    assert_eq!(assignment.workspace.owner.as_deref(), Some("alice"));

    clock.advance(chrono::Duration::minutes(61));
    let outcome = engine.sweep().unwrap();
    assert_eq!(outcome.lifecycle.stopped, vec![id.clone()]);
    assert_eq!(outcome.pools[0].requested, 1);

    let ws = engine.lifecycle().start(&id, "alice").unwrap();
    assert_eq!(ws.state, WorkspaceState::Available);

    engine.ledger().ensure_intact().unwrap();
    assert!(engine.ledger().incomplete_transitions().unwrap().is_empty());
}

#[test]
fn test_pool_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.db");
    let clock = ManualClock::starting_now();

    {
        let engine = sqlite_engine(&path, &clock, 2);
        engine.sweep().unwrap();
        assert_eq!(engine.pools().status_of(&key()).unwrap().ready, 2);
    }

    let engine = sqlite_engine(&path, &clock, 2);
    assert_eq!(engine.pools().status_of(&key()).unwrap().ready, 2);
    let assignment = engine.assign(&request("bob")).unwrap();
    assert_eq!(assignment.path, AssignmentPath::Pooled);
    assert_eq!(engine.pools().status_of(&key()).unwrap().ready, 1);
    engine.ledger().ensure_intact().unwrap();
}

#[test]
fn test_pool_refills_after_ready_workspace_terminated() {
    let clock = ManualClock::starting_now();
    let cp = Arc::new(SimulatedControlPlane::new());
    let engine = Engine::builder(config(2))
        .clock(Arc::new(clock.clone()))
        .control_plane(cp.clone())
        .build()
        .unwrap();

    engine.sweep().unwrap();
    assert_eq!(cp.calls(Op::Create), 2);
    let victim = engine.store().list_instances().unwrap().remove(0);
    engine.lifecycle().terminate(&victim.id, "ops").unwrap();

    let outcome = engine.sweep().unwrap();
    assert_eq!(outcome.pools[0].requested, 1);
    assert_eq!(cp.calls(Op::Create), 3);
    assert_eq!(engine.pools().status_of(&key()).unwrap().ready, 2);

    let pooled = engine.assign(&request("alice")).unwrap();
    assert_eq!(pooled.path, AssignmentPath::Pooled);
    assert_ne!(pooled.workspace.id, victim.id);
}

#[test]
fn test_tampered_database_row_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.db");
    let clock = ManualClock::starting_now();

    let total = {
        let engine = sqlite_engine(&path, &clock, 2);
        engine.sweep().unwrap();
        engine.assign(&request("alice")).unwrap();
        engine.ledger().len().unwrap()
    };
    assert!(total >= 6);

    let raw = Connection::open(&path).unwrap();
    raw.execute_batch("DROP TRIGGER audit_entries_no_update;").unwrap();
    raw.execute("UPDATE audit_entries SET actor = 'mallory' WHERE seq = 2", [])
        .unwrap();
    drop(raw);

    let ledger = AuditLedger::new(Arc::new(SqliteStore::open(&path).unwrap()), Arc::new(SystemClock));
    let report = ledger.verify_all().unwrap();
    assert!(!report.valid);
    assert_eq!(report.first_tampered, Some(2));
    assert_eq!(report.verified, 1);
    assert_eq!(report.untrusted, (2..=total).collect::<Vec<_>>());
    assert!(matches!(
        ledger.ensure_intact(),
        Err(Error::IntegrityViolation { first_tampered: 2 })
    ));

    let head = ledger.verify(1..=1).unwrap();
    assert!(head.valid);
}

#[test]
fn test_circuit_opens_and_recovers() {
    let clock = ManualClock::starting_now();
    let cp = Arc::new(SimulatedControlPlane::new());
    let engine = Engine::builder(config(0))
        .clock(Arc::new(clock.clone()))
        .control_plane(cp.clone())
        .build()
        .unwrap();

    cp.fail_next(Op::Create, 100, Failure::Transient);
    assert!(engine.assign(&request("alice")).is_err());
    assert_eq!(cp.calls(Op::Create), 5);
    assert_eq!(clock.total_slept(), Duration::from_secs(15));
    assert_eq!(engine.client().circuit_state(), CircuitState::Open);

    let err = engine.assign(&request("alice")).unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(cp.calls(Op::Create), 5);

    clock.advance(chrono::Duration::seconds(30));
    cp.clear_failures();
    assert_eq!(engine.client().circuit_state(), CircuitState::HalfOpen);
    engine.assign(&request("alice")).unwrap();
    engine.assign(&request("bob")).unwrap();
    assert_eq!(engine.client().circuit_state(), CircuitState::Closed);

    let failures: Vec<_> = engine
        .ledger()
        .entries(1..=engine.ledger().len().unwrap())
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "control_plane.create" && e.result == AuditResult::Failure)
        .collect();
    assert_eq!(failures.len(), 2);
}

#[test]
fn test_monitor_tracks_both_paths() {
    let clock = ManualClock::starting_now();
    let engine = Engine::builder(config(1))
        .clock(Arc::new(clock.clone()))
        .control_plane(Arc::new(SimulatedControlPlane::new().with_ready_after(2)))
        .build()
        .unwrap();

    engine.sweep().unwrap();
    engine.sweep().unwrap();
    engine.sweep().unwrap();
    assert_eq!(engine.assign(&request("alice")).unwrap().path, AssignmentPath::Pooled);
    let on_demand = engine.assign(&request("bob")).unwrap();
    assert_eq!(on_demand.path, AssignmentPath::OnDemand);
    assert_eq!(on_demand.duration, Duration::from_secs(4));

    let snapshot = engine.monitor().snapshot();
    assert_eq!(snapshot.completed, 2);
    assert_eq!(snapshot.succeeded, 2);
    assert_eq!(snapshot.success_rate, 1.0);
    assert_eq!(snapshot.p99, Some(Duration::from_secs(4)));
    assert_eq!(snapshot.sla_violations, 0);
}

#[test]
fn test_config_file_drives_engine() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.json");
    std::fs::write(
        &path,
        r#"{
            "pools": { "pools": [ { "template_id": "bundle-gpu", "os": "linux", "min": 1, "max": 3, "ceiling": 6 } ] },
            "lifecycle": { "stale_after_days": 14 },
            "regions": { "default_region": "ap-southeast-1" }
        }"#,
    )
    .unwrap();

    let config = EngineConfig::from_file(&path).unwrap();
    assert_eq!(config.lifecycle.stale_grace_days, 7);
    let engine = Engine::in_memory(config).unwrap();
    assert!(engine.pools().contains(&PoolKey::new("bundle-gpu", OperatingSystem::Linux)));
    assert_eq!(engine.selector().default_region(), "ap-southeast-1");
}

#[tokio::test]
async fn test_detached_assignment_completes_after_caller_drops() {
    let engine = Arc::new(Engine::in_memory(config(0)).unwrap());
    let handle = engine.assignment().assign_detached(request("carol"));
    drop(handle);

    let mut assigned = None;
    for _ in 0..200 {
        let owned: Vec<_> = engine
            .store()
            .list_instances()
            .unwrap()
            .into_iter()
            .filter(|ws| ws.owner.as_deref() == Some("carol") && ws.state == WorkspaceState::Available)
            .collect();
        if let Some(ws) = owned.into_iter().next() {
            assigned = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let ws = assigned.expect("detached assignment never completed");
    let entries = engine.ledger().entries_for_subject(&ws.id).unwrap();
    assert!(entries
        .iter()
        .any(|e| e.action == "workspace.assign" && e.result == AuditResult::Success));
}
