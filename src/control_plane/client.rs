//! Control-plane client with circuit breaking and retry
//!
//! The retry policy wraps the circuit-guarded call, so each attempt is seen
//! by the breaker and an opening circuit ends the retry loop immediately.
//! Terminal failures are written to the audit ledger before being returned.

use std::sync::Arc;

use serde_json::json;

use super::{CircuitBreaker, CircuitSnapshot, CircuitState, ControlPlane, CreateRequest, RemoteWorkspace, RetryPolicy};
use crate::audit::AuditLedger;
use crate::clock::SharedClock;
use crate::models::{AuditRecord, AuditResult, WorkspaceInstance};
use crate::{Error, Result};

const ACTOR: &str = "control-plane-client";

pub struct ResilientClient {
    inner: Arc<dyn ControlPlane>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    clock: SharedClock,
    ledger: Arc<AuditLedger>,
}

impl ResilientClient {
    pub fn new(
        inner: Arc<dyn ControlPlane>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        clock: SharedClock,
        ledger: Arc<AuditLedger>,
    ) -> Self {
        Self {
            inner,
            breaker,
            retry,
            clock,
            ledger,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn create(&self, request: &CreateRequest) -> Result<RemoteWorkspace> {
        self.execute("create", &request.workspace_id, || self.inner.create(request))
    }

    pub fn describe(&self, workspace: &WorkspaceInstance) -> Result<RemoteWorkspace> {
        let remote_id = Self::remote_id(workspace)?;
        self.execute("describe", &workspace.id, || self.inner.describe(remote_id))
    }

    pub fn start(&self, workspace: &WorkspaceInstance) -> Result<RemoteWorkspace> {
        let remote_id = Self::remote_id(workspace)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        self.execute("start", &workspace.id, || self.inner.start(&request_id, remote_id))
    }

    pub fn stop(&self, workspace: &WorkspaceInstance) -> Result<RemoteWorkspace> {
        let remote_id = Self::remote_id(workspace)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        self.execute("stop", &workspace.id, || self.inner.stop(&request_id, remote_id))
    }

    pub fn terminate(&self, workspace: &WorkspaceInstance) -> Result<RemoteWorkspace> {
        let remote_id = Self::remote_id(workspace)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        self.execute("terminate", &workspace.id, || self.inner.terminate(&request_id, remote_id))
    }

    fn remote_id(workspace: &WorkspaceInstance) -> Result<&str> {
        workspace
            .remote_id
            .as_deref()
            .ok_or_else(|| Error::Permanent(format!("workspace {} has no control-plane id", workspace.id)))
    }

    fn execute<T>(&self, operation: &str, workspace_id: &str, call: impl Fn() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        let result = self.retry.run(self.clock.as_ref(), operation, |attempt| {
            attempts = attempt;
            self.breaker.call(&call)
        });

        if let Err(e) = &result {
            tracing::error!(
                operation,
                workspace = %workspace_id,
                attempts,
                error = %e,
                "Control-plane call failed"
            );
            let record = AuditRecord::workspace(ACTOR, format!("control_plane.{operation}"), workspace_id, AuditResult::Failure)
                .details(json!({
                    "error_kind": e.kind(),
                    "error": e.to_string(),
                    "attempts": attempts,
                    "circuit": self.breaker.state().to_string(),
                }));
            if let Err(audit_err) = self.ledger.append(record) {
                tracing::error!(workspace = %workspace_id, error = %audit_err, "Failed to audit control-plane failure");
            }
        }
        result
    }
}
