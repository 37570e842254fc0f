//! External provisioning API and the resilient client around it

pub mod circuit;
pub mod client;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::ResilientClient;
pub use retry::RetryPolicy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{OperatingSystem, WorkspaceState};
use crate::Result;

/// Status as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    Pending,
    Starting,
    Available,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Error,
}

impl RemoteStatus {
    /// Engine state this status settles into, if it is a settled state
    pub fn settled_state(&self) -> Option<WorkspaceState> {
        match self {
            RemoteStatus::Available => Some(WorkspaceState::Available),
            RemoteStatus::Stopped => Some(WorkspaceState::Stopped),
            RemoteStatus::Terminated => Some(WorkspaceState::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWorkspace {
    pub remote_id: String,
    pub status: RemoteStatus,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Idempotency key; reused across retries of one logical create
    pub request_id: String,
    pub workspace_id: String,
    pub template_id: String,
    pub os: OperatingSystem,
    pub region: String,
    pub user: Option<String>,
    pub pool_origin: bool,
    pub tags: BTreeMap<String, String>,
}

impl CreateRequest {
    pub fn new(workspace_id: impl Into<String>, template_id: impl Into<String>, os: OperatingSystem, region: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            template_id: template_id.into(),
            os,
            region: region.into(),
            user: None,
            pool_origin: false,
            tags: BTreeMap::new(),
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn pool_origin(mut self, pool_origin: bool) -> Self {
        self.pool_origin = pool_origin;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// The external provisioning API.
///
/// Implementations report network and 5xx-style failures as
/// [`crate::Error::Transient`] and validation or permission failures as
/// [`crate::Error::Permanent`]. Every mutation is idempotent per `request_id`.
pub trait ControlPlane: Send + Sync {
    fn create(&self, request: &CreateRequest) -> Result<RemoteWorkspace>;

    fn describe(&self, remote_id: &str) -> Result<RemoteWorkspace>;

    fn start(&self, request_id: &str, remote_id: &str) -> Result<RemoteWorkspace>;

    fn stop(&self, request_id: &str, remote_id: &str) -> Result<RemoteWorkspace>;

    fn terminate(&self, request_id: &str, remote_id: &str) -> Result<RemoteWorkspace>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_states() {
        assert_eq!(RemoteStatus::Available.settled_state(), Some(WorkspaceState::Available));
        assert_eq!(RemoteStatus::Terminated.settled_state(), Some(WorkspaceState::Terminated));
        assert_eq!(RemoteStatus::Stopping.settled_state(), None);
        assert_eq!(RemoteStatus::Pending.settled_state(), None);
    }

    #[test]
    fn test_create_request_builder() {
        let req = CreateRequest::new("ws-1", "bundle-std", OperatingSystem::Windows, "eu-west-1")
            .user("alice")
            .pool_origin(true)
            .tag("team", "data");
        assert_eq!(req.user.as_deref(), Some("alice"));
        assert!(req.pool_origin);
        assert_eq!(req.tags.get("team").map(String::as_str), Some("data"));
        assert!(!req.request_id.is_empty());
    }
}
