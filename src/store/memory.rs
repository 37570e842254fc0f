//! In-memory store

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{later, Store};
use crate::models::{AuditEntry, AuditResult, InFlight, PoolKey, PoolRecord, WorkspaceInstance};
use crate::{Error, Result};

#[derive(Default, Clone)]
pub struct MemoryStore {
    instances: Arc<RwLock<HashMap<String, WorkspaceInstance>>>,
    pools: Arc<RwLock<BTreeMap<PoolKey, PoolRecord>>>,
    audit: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a stored audit row in place, bypassing the append-only contract
    #[cfg(test)]
    pub(crate) fn overwrite_audit_entry(&self, entry: AuditEntry) {
        let mut audit = self.audit.write();
        if let Some(slot) = audit.iter_mut().find(|e| e.seq == entry.seq) {
            *slot = entry;
        }
    }
}

impl Store for MemoryStore {
    fn insert_instance(&self, instance: &WorkspaceInstance) -> Result<()> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(Error::Config(format!("workspace {} already exists", instance.id)));
        }
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<WorkspaceInstance>> {
        Ok(self.instances.read().get(id).cloned())
    }

    fn update_instance(&self, instance: &WorkspaceInstance) -> Result<()> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| Error::InstanceNotFound(instance.id.clone()))?;
        let last_connected_at = later(stored.last_connected_at, instance.last_connected_at);
        *stored = instance.clone();
        stored.last_connected_at = last_connected_at;
        Ok(())
    }

    fn list_instances(&self) -> Result<Vec<WorkspaceInstance>> {
        let mut list: Vec<_> = self.instances.read().values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    fn try_claim(&self, id: &str, action: &str, now: DateTime<Utc>) -> Result<Option<WorkspaceInstance>> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        if stored.in_flight.is_some() {
            return Ok(None);
        }
        stored.in_flight = Some(InFlight {
            action: action.to_string(),
            since: now,
        });
        Ok(Some(stored.clone()))
    }

    fn release_claim(&self, id: &str) -> Result<()> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        stored.in_flight = None;
        Ok(())
    }

    fn record_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        stored.last_connected_at = later(stored.last_connected_at, Some(at));
        Ok(())
    }

    fn upsert_pool(&self, pool: &PoolRecord) -> Result<()> {
        self.pools.write().insert(pool.key.clone(), pool.clone());
        Ok(())
    }

    fn get_pool(&self, key: &PoolKey) -> Result<Option<PoolRecord>> {
        Ok(self.pools.read().get(key).cloned())
    }

    fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        Ok(self.pools.read().values().cloned().collect())
    }

    fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let mut audit = self.audit.write();
        let expected = audit.len() as u64 + 1;
        if entry.seq != expected {
            return Err(Error::IntegrityViolation { first_tampered: entry.seq });
        }
        audit.push(entry.clone());
        Ok(())
    }

    fn last_audit(&self) -> Result<Option<AuditEntry>> {
        Ok(self.audit.read().last().cloned())
    }

    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.seq >= from && e.seq <= to)
            .cloned()
            .collect())
    }

    fn audit_len(&self) -> Result<u64> {
        Ok(self.audit.read().len() as u64)
    }

    fn audit_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect())
    }

    fn audit_open_transitions(&self) -> Result<Vec<AuditEntry>> {
        let audit = self.audit.read();
        let mut open: Vec<&AuditEntry> = Vec::new();
        for entry in audit.iter() {
            match entry.result {
                AuditResult::Initiated => open.push(entry),
                AuditResult::Success | AuditResult::Failure => {
                    open.retain(|o| o.correlation_id != entry.correlation_id)
                }
            }
        }
        Ok(open.into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditRecord, AuditResult, OperatingSystem, GENESIS_HASH};

    fn workspace() -> WorkspaceInstance {
        WorkspaceInstance::new("bundle-std", OperatingSystem::Windows, "us-east-1", Utc::now(), chrono::Duration::days(30))
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let ws = workspace();
        store.insert_instance(&ws).unwrap();

        let claimed = store.try_claim(&ws.id, "stop", Utc::now()).unwrap();
        assert!(claimed.is_some());
        assert!(store.try_claim(&ws.id, "start", Utc::now()).unwrap().is_none());

        store.release_claim(&ws.id).unwrap();
        assert!(store.try_claim(&ws.id, "start", Utc::now()).unwrap().is_some());
    }

    #[test]
    fn test_update_never_rewinds_activity() {
        let store = MemoryStore::new();
        let ws = workspace();
        store.insert_instance(&ws).unwrap();

        let later_at = Utc::now() + chrono::Duration::minutes(5);
        store.record_activity(&ws.id, later_at).unwrap();
        store.update_instance(&ws).unwrap();

        let stored = store.get_instance(&ws.id).unwrap().unwrap();
        assert_eq!(stored.last_connected_at, Some(later_at));
    }

    #[test]
    fn test_append_rejects_gap() {
        let store = MemoryStore::new();
        let record = AuditRecord::workspace("test", "noop", "ws-1", AuditResult::Success);
        let entry = AuditEntry::seal(2, Utc::now(), record, GENESIS_HASH);
        assert!(store.append_audit(&entry).is_err());
        assert_eq!(store.audit_len().unwrap(), 0);
    }

    #[test]
    fn test_missing_instance() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.try_claim("ws-nope", "stop", Utc::now()),
            Err(Error::InstanceNotFound(_))
        ));
    }
}
