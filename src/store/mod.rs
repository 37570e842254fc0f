//! Persistence contract
//!
//! The engine only needs CRUD over workspaces and pools, an atomic claim of
//! the per-workspace in-flight marker, and an append-only audit relation.
//! [`MemoryStore`] backs tests and embedded use; [`SqliteStore`] persists to
//! disk and enforces append-only audit rows with triggers.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::models::{AuditEntry, PoolKey, PoolRecord, WorkspaceInstance};
use crate::Result;

pub trait Store: Send + Sync {
    fn insert_instance(&self, instance: &WorkspaceInstance) -> Result<()>;

    fn get_instance(&self, id: &str) -> Result<Option<WorkspaceInstance>>;

    /// Overwrite a workspace. `last_connected_at` never moves backwards.
    fn update_instance(&self, instance: &WorkspaceInstance) -> Result<()>;

    fn list_instances(&self) -> Result<Vec<WorkspaceInstance>>;

    /// Atomically set the in-flight marker if none is set.
    ///
    /// Returns the workspace as stored after the claim, or `None` when another
    /// action already holds it.
    fn try_claim(&self, id: &str, action: &str, now: DateTime<Utc>) -> Result<Option<WorkspaceInstance>>;

    /// Clear the in-flight marker
    fn release_claim(&self, id: &str) -> Result<()>;

    /// Move the idle marker forward without taking a claim
    fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    fn upsert_pool(&self, pool: &PoolRecord) -> Result<()>;

    fn get_pool(&self, key: &PoolKey) -> Result<Option<PoolRecord>>;

    fn list_pools(&self) -> Result<Vec<PoolRecord>>;

    /// Append one sealed entry. Rejects anything but the next sequence number.
    fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    fn last_audit(&self) -> Result<Option<AuditEntry>>;

    /// Entries with `from <= seq <= to`, ordered by seq
    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>>;

    fn audit_len(&self) -> Result<u64>;

    /// Entries about one subject, ordered by seq
    fn audit_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>>;

    /// INITIATED entries with no later entry sharing their correlation id
    fn audit_open_transitions(&self) -> Result<Vec<AuditEntry>>;
}

pub(crate) fn later(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
