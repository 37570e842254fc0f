//! Workspace lifecycle state machine
//!
//! A periodic sweep drives the time-based transitions:
//!
//! - `Available -> Stopped` after `auto_stop_timeout_minutes` without activity
//! - `Stopped -> Stale` after the stale window, with one owner notification
//! - `Stale -> Terminated` once the grace period after notification passes
//! - anything live `-> Terminated` past `max_lifetime_deadline`
//!
//! `keep_alive` suppresses idle stop and stale handling but never the lifetime
//! limit. Every transition claims the workspace's in-flight marker, writes an
//! INITIATED audit entry before the control-plane call and the outcome after.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::assignment::Customizer;
use crate::audit::AuditLedger;
use crate::clock::SharedClock;
use crate::config::LifecycleConfig;
use crate::control_plane::{RemoteStatus, ResilientClient};
use crate::models::{AuditRecord, AuditResult, WorkspaceInstance, WorkspaceState};
use crate::store::Store;
use crate::{Error, Result};

const SWEEP_ACTOR: &str = "lifecycle-sweep";

const LIVE: &[WorkspaceState] = &[
    WorkspaceState::Pending,
    WorkspaceState::Available,
    WorkspaceState::Stopped,
    WorkspaceState::Stale,
];

/// Notification channel to workspace owners
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    /// The workspace went stale and will be terminated after `terminate_after`
    fn workspace_stale(&self, workspace: &WorkspaceInstance, terminate_after: DateTime<Utc>) -> Result<()>;
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn workspace_stale(&self, workspace: &WorkspaceInstance, terminate_after: DateTime<Utc>) -> Result<()> {
        tracing::info!(
            instance = %workspace.id,
            owner = ?workspace.owner,
            terminate_after = %terminate_after,
            "Workspace is stale"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxLifetime,
    Stale,
    Requested,
    CustomizationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Stop,
    MarkStale,
    Notify,
    Terminate(TerminationReason),
    Reconcile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub instance_id: String,
    pub error_kind: String,
    pub error: String,
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Workspaces with an action already in flight
    pub skipped_busy: usize,
    pub stopped: Vec<String>,
    pub marked_stale: Vec<String>,
    pub notified: Vec<String>,
    /// Terminated or terminating
    pub terminated: Vec<String>,
    /// Pending workspaces that became available
    pub promoted: Vec<String>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    /// Number of workspaces changed
    pub fn actions(&self) -> usize {
        self.stopped.len() + self.marked_stale.len() + self.notified.len() + self.terminated.len() + self.promoted.len()
    }
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    client: Arc<ResilientClient>,
    ledger: Arc<AuditLedger>,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    customizer: Arc<Customizer>,
    stale_after: chrono::Duration,
    stale_grace: chrono::Duration,
    max_customization_failures: u32,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<ResilientClient>,
        ledger: Arc<AuditLedger>,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
        customizer: Arc<Customizer>,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            store,
            client,
            ledger,
            clock,
            notifier,
            customizer,
            stale_after: chrono::Duration::days(i64::from(config.stale_after_days)),
            stale_grace: chrono::Duration::days(i64::from(config.stale_grace_days)),
            max_customization_failures: config.max_customization_failures.max(1),
        }
    }

    pub fn get(&self, id: &str) -> Result<WorkspaceInstance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    /// Evaluate every workspace once.
    ///
    /// Decisions are re-checked after the claim, so a workspace that changed
    /// since it was listed is left alone. Per-workspace failures are reported,
    /// not returned.
    pub fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for ws in self.store.list_instances()? {
            if ws.state.is_terminal() {
                continue;
            }
            report.examined += 1;
            if ws.is_busy() {
                report.skipped_busy += 1;
                continue;
            }
            let Some(decision) = self.decide(&ws, now) else {
                continue;
            };

            match self.sweep_one(&ws.id, decision, now) {
                Ok(Some(after)) => record(&mut report, decision, &after),
                Ok(None) => {}
                Err(Error::InstanceBusy(_)) => report.skipped_busy += 1,
                Err(e) => {
                    tracing::warn!(instance = %ws.id, decision = ?decision, error = %e, "Sweep action failed");
                    report.failures.push(SweepFailure {
                        instance_id: ws.id.clone(),
                        error_kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            stopped = report.stopped.len(),
            stale = report.marked_stale.len(),
            terminated = report.terminated.len(),
            promoted = report.promoted.len(),
            busy = report.skipped_busy,
            failures = report.failures.len(),
            "Lifecycle sweep complete"
        );
        Ok(report)
    }

    /// User-requested start of a stopped or stale workspace
    pub fn start(&self, id: &str, actor: &str) -> Result<WorkspaceInstance> {
        let ws = self.claim(id, "start", &[WorkspaceState::Stopped, WorkspaceState::Stale])?;
        let now = self.clock.now();
        self.transition(ws, actor, "workspace.start", |ws| {
            self.client.start(ws)?;
            ws.state = WorkspaceState::Available;
            ws.last_connected_at = Some(now);
            ws.stopped_at = None;
            ws.stale_at = None;
            ws.stale_notified_at = None;
            ws.stale_clock_anchor = None;
            Ok(Value::Null)
        })
    }

    /// User-requested stop of an available workspace
    pub fn stop(&self, id: &str, actor: &str) -> Result<WorkspaceInstance> {
        let ws = self.claim(id, "stop", &[WorkspaceState::Available])?;
        let now = self.clock.now();
        self.transition(ws, actor, "workspace.stop", |ws| self.do_stop(ws, now))
    }

    /// User-requested termination, the direct path out of any live state
    pub fn terminate(&self, id: &str, actor: &str) -> Result<WorkspaceInstance> {
        let ws = self.claim(id, "terminate", LIVE)?;
        self.transition(ws, actor, "workspace.terminate", |ws| {
            self.do_terminate(ws, TerminationReason::Requested)
        })
    }

    /// Move the idle marker forward
    pub fn record_activity(&self, id: &str) -> Result<()> {
        let ws = self.get(id)?;
        if ws.state.is_terminal() {
            return Err(Error::invalid_state(ws.state, "a live workspace"));
        }
        self.store.record_activity(id, self.clock.now())
    }

    /// Set or clear keep-alive; setting it also renews the stale clock
    pub fn set_keep_alive(&self, id: &str, keep_alive: bool, actor: &str) -> Result<WorkspaceInstance> {
        let ws = self.claim(id, "keep_alive", LIVE)?;
        let now = self.clock.now();
        self.transition(ws, actor, "workspace.keep_alive", |ws| {
            ws.keep_alive = keep_alive;
            if keep_alive {
                renew(ws, now);
            }
            Ok(json!({ "keep_alive": keep_alive }))
        })
    }

    /// Restart the stale window; a stale workspace returns to `Stopped`
    pub fn renew_keep_alive(&self, id: &str, actor: &str) -> Result<WorkspaceInstance> {
        let ws = self.claim(id, "renew", LIVE)?;
        let now = self.clock.now();
        self.transition(ws, actor, "workspace.renew", |ws| {
            renew(ws, now);
            Ok(json!({ "stale_clock_anchor": now }))
        })
    }

    fn decide(&self, ws: &WorkspaceInstance, now: DateTime<Utc>) -> Option<Decision> {
        use WorkspaceState::*;

        match ws.state {
            Pending | Available | Stopped | Stale if now >= ws.max_lifetime_deadline => {
                Some(Decision::Terminate(TerminationReason::MaxLifetime))
            }
            Available => {
                let timeout = chrono::Duration::minutes(i64::from(ws.auto_stop_timeout_minutes));
                let idle = now - ws.last_activity();
                let eligible = !ws.keep_alive && !ws.is_unassigned_in_pool() && ws.auto_stop_timeout_minutes > 0;
                (eligible && idle >= timeout).then_some(Decision::Stop)
            }
            Stopped => {
                let since = ws.stale_window_start()?;
                (!ws.keep_alive && now - since >= self.stale_after).then_some(Decision::MarkStale)
            }
            Stale if ws.keep_alive => None,
            Stale => match ws.stale_notified_at {
                None => Some(Decision::Notify),
                Some(at) if now - at >= self.stale_grace => Some(Decision::Terminate(TerminationReason::Stale)),
                Some(_) => None,
            },
            Pending if ws.remote_id.is_some() => Some(Decision::Reconcile),
            Terminating => Some(Decision::Reconcile),
            _ => None,
        }
    }

    fn sweep_one(&self, id: &str, decision: Decision, now: DateTime<Utc>) -> Result<Option<WorkspaceInstance>> {
        let ws = self
            .store
            .try_claim(id, "sweep", now)?
            .ok_or_else(|| Error::InstanceBusy(id.to_string()))?;
        if self.decide(&ws, now) != Some(decision) {
            self.release(id);
            return Ok(None);
        }

        match decision {
            Decision::Stop => self
                .transition(ws, SWEEP_ACTOR, "workspace.stop", |ws| self.do_stop(ws, now))
                .map(Some),
            Decision::MarkStale => self
                .transition(ws, SWEEP_ACTOR, "workspace.mark_stale", |ws| {
                    ws.state = WorkspaceState::Stale;
                    ws.stale_at = Some(now);
                    ws.stale_notified_at = None;
                    let notified = self.notify(ws, now).is_ok();
                    Ok(json!({ "notified": notified }))
                })
                .map(Some),
            Decision::Notify => self
                .transition(ws, SWEEP_ACTOR, "workspace.notify_stale", |ws| {
                    self.notify(ws, now)?;
                    Ok(Value::Null)
                })
                .map(Some),
            Decision::Terminate(reason) => self
                .transition(ws, SWEEP_ACTOR, "workspace.terminate", |ws| self.do_terminate(ws, reason))
                .map(Some),
            Decision::Reconcile => self.reconcile(ws),
        }
    }

    fn do_stop(&self, ws: &mut WorkspaceInstance, now: DateTime<Utc>) -> Result<Value> {
        let remote = self.client.stop(ws)?;
        ws.state = WorkspaceState::Stopped;
        ws.stopped_at = Some(now);
        ws.stale_clock_anchor = None;
        Ok(json!({ "idle_minutes": (now - ws.last_activity()).num_minutes(), "remote_status": remote.status }))
    }

    fn do_terminate(&self, ws: &mut WorkspaceInstance, reason: TerminationReason) -> Result<Value> {
        if ws.remote_id.is_none() {
            ws.state = WorkspaceState::Terminated;
            return Ok(json!({ "reason": reason }));
        }
        let remote = self.client.terminate(ws)?;
        ws.state = match remote.status {
            RemoteStatus::Terminated => WorkspaceState::Terminated,
            _ => WorkspaceState::Terminating,
        };
        Ok(json!({ "reason": reason, "remote_status": remote.status }))
    }

    fn notify(&self, ws: &mut WorkspaceInstance, now: DateTime<Utc>) -> Result<()> {
        match self.notifier.workspace_stale(ws, now + self.stale_grace) {
            Ok(()) => {
                ws.stale_notified_at = Some(now);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(instance = %ws.id, error = %e, "Stale notification failed; will retry");
                Err(e)
            }
        }
    }

    /// Settle `Pending` and `Terminating` workspaces from the control plane's view
    fn reconcile(&self, mut ws: WorkspaceInstance) -> Result<Option<WorkspaceInstance>> {
        let remote = match self.client.describe(&ws) {
            Ok(remote) => remote,
            Err(e) => {
                self.release(&ws.id);
                return Err(e);
            }
        };
        let from = ws.state;

        match (from, remote.status) {
            (WorkspaceState::Terminating, RemoteStatus::Terminated) | (WorkspaceState::Pending, RemoteStatus::Terminated) => {
                ws.state = WorkspaceState::Terminated;
            }
            (WorkspaceState::Pending, RemoteStatus::Error) => {
                return self
                    .transition(ws, SWEEP_ACTOR, "workspace.terminate", |ws| {
                        self.do_terminate(ws, TerminationReason::Requested)
                    })
                    .map(Some);
            }
            (WorkspaceState::Pending, RemoteStatus::Available) => {
                if let Some(customization) = ws.pending_customization.clone() {
                    if let Err(e) = self.customizer.apply(&mut ws, &customization) {
                        return self.customization_failed(ws, e);
                    }
                }
                ws.state = WorkspaceState::Available;
                ws.pending_customization = None;
            }
            _ => {
                self.release(&ws.id);
                return Ok(None);
            }
        }

        if !from.can_transition_to(ws.state) {
            self.release(&ws.id);
            return Err(Error::invalid_state(from, format!("a state that may move to {}", ws.state)));
        }
        ws.in_flight = None;
        ws.updated_at = self.clock.now();
        self.store.update_instance(&ws)?;
        self.ledger.append(
            AuditRecord::workspace(SWEEP_ACTOR, "workspace.reconcile", &ws.id, AuditResult::Success)
                .details(json!({ "from": from, "to": ws.state, "remote_status": remote.status })),
        )?;
        tracing::info!(instance = %ws.id, from = %from, to = %ws.state, "Workspace reconciled");
        Ok(Some(ws))
    }

    /// A pending workspace stays pending for another try unless permanent
    /// failures reached the limit, in which case it is terminated.
    fn customization_failed(&self, mut ws: WorkspaceInstance, cause: Error) -> Result<Option<WorkspaceInstance>> {
        let permanent = matches!(cause, Error::Permanent(_));
        if permanent {
            ws.customization_failures += 1;
        }
        let details = json!({
            "error_kind": "partial_failure",
            "error": cause.to_string(),
            "permanent_failures": ws.customization_failures,
        });

        if permanent && ws.customization_failures >= self.max_customization_failures {
            tracing::warn!(
                instance = %ws.id,
                failures = ws.customization_failures,
                error = %cause,
                "Customization keeps failing, terminating workspace"
            );
            if let Err(e) = self.ledger.append(
                AuditRecord::workspace(SWEEP_ACTOR, "workspace.customize", &ws.id, AuditResult::Failure).details(details),
            ) {
                self.release(&ws.id);
                return Err(e);
            }
            return self
                .transition(ws, SWEEP_ACTOR, "workspace.terminate", |ws| {
                    self.do_terminate(ws, TerminationReason::CustomizationFailed)
                })
                .map(Some);
        }

        if permanent {
            ws.in_flight = None;
            ws.updated_at = self.clock.now();
            if let Err(e) = self.store.update_instance(&ws) {
                self.release(&ws.id);
                return Err(e);
            }
        } else {
            self.release(&ws.id);
        }
        self.ledger.append(
            AuditRecord::workspace(SWEEP_ACTOR, "workspace.customize", &ws.id, AuditResult::Failure).details(details),
        )?;
        Err(Error::PartialFailure {
            instance_id: ws.id.clone(),
            step: "customization".into(),
            cause: cause.to_string(),
        })
    }

    fn claim(&self, id: &str, action: &str, expected: &[WorkspaceState]) -> Result<WorkspaceInstance> {
        let ws = self
            .store
            .try_claim(id, action, self.clock.now())?
            .ok_or_else(|| Error::InstanceBusy(id.to_string()))?;
        if !expected.contains(&ws.state) {
            self.release(id);
            let names: Vec<_> = expected.iter().map(|s| s.as_str()).collect();
            return Err(Error::invalid_state(ws.state, names.join(" or ")));
        }
        Ok(ws)
    }

    fn release(&self, id: &str) {
        if let Err(e) = self.store.release_claim(id) {
            tracing::error!(instance = %id, error = %e, "Failed to release claim");
        }
    }

    /// Run `step` on a claimed workspace between an INITIATED and an outcome
    /// audit entry. The claim is always released.
    fn transition(
        &self,
        mut ws: WorkspaceInstance,
        actor: &str,
        action: &str,
        step: impl FnOnce(&mut WorkspaceInstance) -> Result<Value>,
    ) -> Result<WorkspaceInstance> {
        let from = ws.state;
        let handle = match self
            .ledger
            .open_transition(actor, action, &ws.id, json!({ "from": from }))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.release(&ws.id);
                return Err(e);
            }
        };

        let outcome = step(&mut ws).and_then(|extra| {
            if ws.state != from && !from.can_transition_to(ws.state) {
                return Err(Error::invalid_state(from, format!("a state that may move to {}", ws.state)));
            }
            ws.in_flight = None;
            ws.updated_at = self.clock.now();
            self.store.update_instance(&ws)?;
            Ok(extra)
        });

        match outcome {
            Ok(extra) => {
                let mut details = json!({ "from": from, "to": ws.state });
                if let (Some(map), Value::Object(extra)) = (details.as_object_mut(), extra) {
                    map.extend(extra);
                }
                self.ledger.close_transition(handle, AuditResult::Success, details)?;
                tracing::info!(instance = %ws.id, action, from = %from, to = %ws.state, "Workspace transitioned");
                Ok(ws)
            }
            Err(e) => {
                self.release(&ws.id);
                let details = json!({ "from": from, "error_kind": e.kind(), "error": e.to_string() });
                if let Err(audit_err) = self.ledger.close_transition(handle, AuditResult::Failure, details) {
                    tracing::error!(instance = %ws.id, error = %audit_err, "Failed to audit transition failure");
                }
                Err(e)
            }
        }
    }
}

fn renew(ws: &mut WorkspaceInstance, now: DateTime<Utc>) {
    ws.stale_clock_anchor = Some(now);
    if ws.state == WorkspaceState::Stale {
        ws.state = WorkspaceState::Stopped;
        ws.stale_at = None;
        ws.stale_notified_at = None;
    }
}

fn record(report: &mut SweepReport, decision: Decision, after: &WorkspaceInstance) {
    let id = after.id.clone();
    match decision {
        Decision::Stop => report.stopped.push(id),
        Decision::MarkStale => {
            if after.stale_notified_at.is_some() {
                report.notified.push(id.clone());
            }
            report.marked_stale.push(id);
        }
        Decision::Notify => report.notified.push(id),
        Decision::Terminate(_) => report.terminated.push(id),
        Decision::Reconcile => match after.state {
            WorkspaceState::Available => report.promoted.push(id),
            WorkspaceState::Terminated | WorkspaceState::Terminating => report.terminated.push(id),
            _ => {}
        },
    }
}
