//! Workspace Fleet
//!
//! A provisioning and lifecycle engine for remote desktop workspaces. It
//! brokers every call to an external, rate-limited control plane through a
//! circuit breaker and bounded retry, keeps pools of pre-warmed workspaces per
//! (template, OS), hands them to users or falls back to on-demand creation in
//! the nearest region, and stops, marks stale and terminates idle workspaces
//! on a periodic sweep.
//!
//! # Key Features
//!
//! - **Resilient control-plane client** - circuit breaking with half-open
//!   trials, exponential backoff for transient failures
//! - **Warm pools** - demand-driven `[min, max]` band with an absolute ceiling
//! - **Lifecycle sweep** - idle stop, stale marking with owner notification,
//!   max-lifetime termination, all idempotent
//! - **Tamper-evident audit** - SHA-256 hash chain over an append-only ledger
//!
//! # Example
//!
//! ```no_run
//! use workspace_fleet::{AssignmentRequest, Engine, EngineConfig, OperatingSystem, PoolSpec};
//!
//! let config = EngineConfig::new()
//!     .pool(PoolSpec::new("bundle-std", OperatingSystem::Windows).min(2).max(10))
//!     .default_region("eu-west-1");
//!
//! let engine = Engine::with_sqlite(config, "fleet.db")?;
//! engine.sweep()?;
//!
//! let request = AssignmentRequest::new("bundle-std", OperatingSystem::Windows, "alice");
//! let assignment = engine.assign(&request)?;
//! println!("{} via {}", assignment.workspace.id, assignment.path);
//!
//! engine.ledger().ensure_intact()?;
//! # Ok::<(), workspace_fleet::Error>(())
//! ```

pub mod assignment;
pub mod audit;
pub mod clock;
pub mod config;
pub mod control_plane;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod models;
pub mod monitor;
pub mod pool;
pub mod region;
pub mod store;

pub use assignment::{Assignment, AssignmentPath, AssignmentRequest, PoolAssignmentService};
pub use audit::{AuditLedger, VerifyReport};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{EngineConfig, PoolSpec};
pub use control_plane::{CircuitState, ControlPlane, ResilientClient};
pub use engine::{Engine, EngineBuilder, Workers};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleManager, Notifier, SweepReport};
pub use models::{AuditEntry, AuditResult, Customization, OperatingSystem, PoolKey, WorkspaceInstance, WorkspaceState};
pub use monitor::{MetricsSink, ProvisioningMonitor};
pub use pool::PoolManager;
pub use region::{CallerLocation, RegionSelector};
pub use store::{MemoryStore, SqliteStore, Store};
