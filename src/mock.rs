//! In-process control plane for tests, demos and local runs

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::control_plane::{ControlPlane, CreateRequest, RemoteStatus, RemoteWorkspace};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Describe,
    Start,
    Stop,
    Terminate,
}

/// Scripted failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

impl Failure {
    fn into_error(self, op: Op) -> Error {
        match self {
            Failure::Transient => Error::Transient(format!("simulated 503 on {op:?}")),
            Failure::Permanent => Error::Permanent(format!("simulated validation error on {op:?}")),
        }
    }
}

#[derive(Debug, Clone)]
struct SimWorkspace {
    status: RemoteStatus,
    region: String,
    describes_until_ready: u32,
}

#[derive(Debug, Default)]
struct SimState {
    workspaces: HashMap<String, SimWorkspace>,
    failures: HashMap<Op, VecDeque<Failure>>,
    calls: HashMap<Op, u32>,
    /// request id -> remote id, for idempotent creates
    created: HashMap<String, String>,
}

/// Control plane that keeps workspaces in memory.
///
/// Creates start `Pending` and become `Available` after a configurable number
/// of describes. Failures can be queued per operation.
#[derive(Debug, Default)]
pub struct SimulatedControlPlane {
    state: Mutex<SimState>,
    ready_after_describes: u32,
    latency: Duration,
    async_terminate: bool,
}

impl SimulatedControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describes that report `Pending` before a new workspace is `Available`
    pub fn with_ready_after(mut self, describes: u32) -> Self {
        self.ready_after_describes = describes;
        self
    }

    /// Wall-clock delay added to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Terminate reports `Terminating`; the next describe reports `Terminated`
    pub fn with_async_terminate(mut self, enabled: bool) -> Self {
        self.async_terminate = enabled;
        self
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: Op, times: u32, failure: Failure) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(failure);
        }
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn remote_status(&self, remote_id: &str) -> Option<RemoteStatus> {
        self.state.lock().workspaces.get(remote_id).map(|w| w.status)
    }

    pub fn workspace_count(&self) -> usize {
        self.state.lock().workspaces.len()
    }

    fn enter(&self, op: Op) -> Result<parking_lot::MutexGuard<'_, SimState>> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(failure) = state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            return Err(failure.into_error(op));
        }
        Ok(state)
    }

    fn transition(&self, op: Op, remote_id: &str, allowed: &[RemoteStatus], next: RemoteStatus) -> Result<RemoteWorkspace> {
        let mut state = self.enter(op)?;
        let ws = state
            .workspaces
            .get_mut(remote_id)
            .ok_or_else(|| Error::Permanent(format!("workspace {remote_id} not found")))?;
        if ws.status != next && !allowed.contains(&ws.status) {
            return Err(Error::Permanent(format!(
                "cannot {op:?} workspace {remote_id} in status {:?}",
                ws.status
            )));
        }
        ws.status = next;
        Ok(RemoteWorkspace {
            remote_id: remote_id.to_string(),
            status: ws.status,
            region: ws.region.clone(),
        })
    }
}

impl ControlPlane for SimulatedControlPlane {
    fn create(&self, request: &CreateRequest) -> Result<RemoteWorkspace> {
        let mut state = self.enter(Op::Create)?;
        if let Some(remote_id) = state.created.get(&request.request_id).cloned() {
            if let Some(ws) = state.workspaces.get(&remote_id) {
                return Ok(RemoteWorkspace {
                    remote_id,
                    status: ws.status,
                    region: ws.region.clone(),
                });
            }
        }
        if request.template_id.is_empty() {
            return Err(Error::Permanent("template id is required".into()));
        }

        let remote_id = format!("wsp-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let status = if self.ready_after_describes == 0 {
            RemoteStatus::Available
        } else {
            RemoteStatus::Pending
        };
        state.workspaces.insert(
            remote_id.clone(),
            SimWorkspace {
                status,
                region: request.region.clone(),
                describes_until_ready: self.ready_after_describes,
            },
        );
        state.created.insert(request.request_id.clone(), remote_id.clone());
        Ok(RemoteWorkspace {
            remote_id,
            status,
            region: request.region.clone(),
        })
    }

    fn describe(&self, remote_id: &str) -> Result<RemoteWorkspace> {
        let mut state = self.enter(Op::Describe)?;
        let ws = state
            .workspaces
            .get_mut(remote_id)
            .ok_or_else(|| Error::Permanent(format!("workspace {remote_id} not found")))?;
        match ws.status {
            RemoteStatus::Pending => {
                ws.describes_until_ready = ws.describes_until_ready.saturating_sub(1);
                if ws.describes_until_ready == 0 {
                    ws.status = RemoteStatus::Available;
                }
            }
            RemoteStatus::Terminating => ws.status = RemoteStatus::Terminated,
            _ => {}
        }
        Ok(RemoteWorkspace {
            remote_id: remote_id.to_string(),
            status: ws.status,
            region: ws.region.clone(),
        })
    }

    fn start(&self, _request_id: &str, remote_id: &str) -> Result<RemoteWorkspace> {
        self.transition(Op::Start, remote_id, &[RemoteStatus::Stopped], RemoteStatus::Available)
    }

    fn stop(&self, _request_id: &str, remote_id: &str) -> Result<RemoteWorkspace> {
        self.transition(Op::Stop, remote_id, &[RemoteStatus::Available], RemoteStatus::Stopped)
    }

    fn terminate(&self, _request_id: &str, remote_id: &str) -> Result<RemoteWorkspace> {
        let next = if self.async_terminate {
            RemoteStatus::Terminating
        } else {
            RemoteStatus::Terminated
        };
        self.transition(
            Op::Terminate,
            remote_id,
            &[
                RemoteStatus::Pending,
                RemoteStatus::Available,
                RemoteStatus::Stopped,
                RemoteStatus::Terminating,
            ],
            next,
        )
    }
}
