//! Workspace instance model

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    /// Requested from the control plane, not yet usable
    Pending,
    /// Running and connectable
    Available,
    /// Powered off, disk retained
    Stopped,
    /// Stopped long enough to be a termination candidate
    Stale,
    /// Terminate issued, awaiting completion
    Terminating,
    /// Gone
    Terminated,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Pending => "pending",
            WorkspaceState::Available => "available",
            WorkspaceState::Stopped => "stopped",
            WorkspaceState::Stale => "stale",
            WorkspaceState::Terminating => "terminating",
            WorkspaceState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == WorkspaceState::Terminated
    }

    /// Edges of the lifecycle graph
    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        use WorkspaceState::*;
        matches!(
            (self, next),
            (Pending, Available)
                | (Pending, Terminating)
                | (Pending, Terminated)
                | (Available, Stopped)
                | (Available, Terminating)
                | (Available, Terminated)
                | (Stopped, Available)
                | (Stopped, Stale)
                | (Stopped, Terminating)
                | (Stopped, Terminated)
                | (Stale, Available)
                | (Stale, Stopped)
                | (Stale, Terminating)
                | (Stale, Terminated)
                | (Terminating, Terminated)
        )
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkspaceState::Pending),
            "available" => Ok(WorkspaceState::Available),
            "stopped" => Ok(WorkspaceState::Stopped),
            "stale" => Ok(WorkspaceState::Stale),
            "terminating" => Ok(WorkspaceState::Terminating),
            "terminated" => Ok(WorkspaceState::Terminated),
            other => Err(crate::Error::Config(format!("unknown workspace state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    Windows,
    Linux,
}

impl OperatingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingSystem::Windows => "windows",
            OperatingSystem::Linux => "linux",
        }
    }
}

impl std::fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingSystem {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "windows" => Ok(OperatingSystem::Windows),
            "linux" => Ok(OperatingSystem::Linux),
            other => Err(crate::Error::Config(format!("unknown operating system: {other}"))),
        }
    }
}

/// Marker for a control-plane mutation that has not completed yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub action: String,
    pub since: DateTime<Utc>,
}

/// Per-requester changes applied when a workspace is handed out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customization {
    /// Region tag recorded on the workspace (pooled instances keep their serving region)
    pub region_tag: Option<String>,
    /// Bind the workspace to the user through the directory service
    pub join_directory: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Customization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region_tag(mut self, tag: impl Into<String>) -> Self {
        self.region_tag = Some(tag.into());
        self
    }

    pub fn join_directory(mut self, join: bool) -> Self {
        self.join_directory = join;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A provisioned remote desktop environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInstance {
    /// Engine-side identifier
    pub id: String,
    /// Identifier assigned by the control plane once created
    pub remote_id: Option<String>,
    /// Owning user; `None` while unassigned in a pool
    pub owner: Option<String>,
    pub template_id: String,
    pub os: OperatingSystem,
    pub region: String,
    pub state: WorkspaceState,
    pub created_at: DateTime<Utc>,
    /// Idle marker: last user connection or activity
    pub last_connected_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stale_at: Option<DateTime<Utc>>,
    pub stale_notified_at: Option<DateTime<Utc>>,
    /// Set by keep-alive renewal; restarts the stale window
    pub stale_clock_anchor: Option<DateTime<Utc>>,
    pub max_lifetime_deadline: DateTime<Utc>,
    pub auto_stop_timeout_minutes: u32,
    pub keep_alive: bool,
    pub pool_origin: bool,
    pub in_flight: Option<InFlight>,
    /// Customization still to apply (partial failure recovery)
    pub pending_customization: Option<Customization>,
    /// Permanent customization failures seen by reconciliation
    #[serde(default)]
    pub customization_failures: u32,
    pub metadata: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceInstance {
    pub fn new(
        template_id: impl Into<String>,
        os: OperatingSystem,
        region: impl Into<String>,
        now: DateTime<Utc>,
        max_lifetime: chrono::Duration,
    ) -> Self {
        Self {
            id: format!("ws-{}", uuid::Uuid::new_v4()),
            remote_id: None,
            owner: None,
            template_id: template_id.into(),
            os,
            region: region.into(),
            state: WorkspaceState::Pending,
            created_at: now,
            last_connected_at: None,
            stopped_at: None,
            stale_at: None,
            stale_notified_at: None,
            stale_clock_anchor: None,
            max_lifetime_deadline: now + max_lifetime,
            auto_stop_timeout_minutes: 60,
            keep_alive: false,
            pool_origin: false,
            in_flight: None,
            pending_customization: None,
            customization_failures: 0,
            metadata: BTreeMap::new(),
            updated_at: now,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_pool_origin(mut self, pool_origin: bool) -> Self {
        self.pool_origin = pool_origin;
        self
    }

    pub fn with_auto_stop_minutes(mut self, minutes: u32) -> Self {
        self.auto_stop_timeout_minutes = minutes;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn pool_key(&self) -> super::PoolKey {
        super::PoolKey::new(self.template_id.clone(), self.os)
    }

    /// Most recent evidence of use; creation counts as activity
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_connected_at.unwrap_or(self.created_at)
    }

    /// Start of the current stale window
    pub fn stale_window_start(&self) -> Option<DateTime<Utc>> {
        match (self.stopped_at, self.stale_clock_anchor) {
            (Some(stopped), Some(anchor)) => Some(stopped.max(anchor)),
            (Some(stopped), None) => Some(stopped),
            (None, anchor) => anchor,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_unassigned_in_pool(&self) -> bool {
        self.pool_origin && self.owner.is_none() && self.state == WorkspaceState::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> WorkspaceInstance {
        WorkspaceInstance::new("bundle-std", OperatingSystem::Windows, "eu-west-1", now, chrono::Duration::days(365))
    }

    #[test]
    fn test_state_round_trip_str() {
        for state in [
            WorkspaceState::Pending,
            WorkspaceState::Available,
            WorkspaceState::Stopped,
            WorkspaceState::Stale,
            WorkspaceState::Terminating,
            WorkspaceState::Terminated,
        ] {
            assert_eq!(state.as_str().parse::<WorkspaceState>().unwrap(), state);
        }
        assert!("running".parse::<WorkspaceState>().is_err());
    }

    #[test]
    fn test_transition_graph() {
        use WorkspaceState::*;
        assert!(Available.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Available));
        assert!(Stopped.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Terminated));
        assert!(Available.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Available));
        assert!(!Pending.can_transition_to(Stopped));
        assert!(!Available.can_transition_to(Stale));
    }

    #[test]
    fn test_new_instance_defaults() {
        let now = Utc::now();
        let ws = sample(now);
        assert!(ws.id.starts_with("ws-"));
        assert_eq!(ws.state, WorkspaceState::Pending);
        assert_eq!(ws.max_lifetime_deadline, now + chrono::Duration::days(365));
        assert_eq!(ws.last_activity(), now);
        assert!(!ws.is_busy());
        assert!(!ws.is_unassigned_in_pool());
    }

    #[test]
    fn test_stale_window_prefers_later_anchor() {
        let now = Utc::now();
        let mut ws = sample(now);
        assert_eq!(ws.stale_window_start(), None);

        ws.stopped_at = Some(now);
        assert_eq!(ws.stale_window_start(), Some(now));

        let renewed = now + chrono::Duration::days(31);
        ws.stale_clock_anchor = Some(renewed);
        assert_eq!(ws.stale_window_start(), Some(renewed));
    }

    #[test]
    fn test_os_parse() {
        assert_eq!("Windows".parse::<OperatingSystem>().unwrap(), OperatingSystem::Windows);
        assert_eq!("linux".parse::<OperatingSystem>().unwrap(), OperatingSystem::Linux);
        assert!("beos".parse::<OperatingSystem>().is_err());
    }
}
