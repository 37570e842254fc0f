//! Warm pool model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OperatingSystem;

/// Pools are keyed by (template, OS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub template_id: String,
    pub os: OperatingSystem,
}

impl PoolKey {
    pub fn new(template_id: impl Into<String>, os: OperatingSystem) -> Self {
        Self {
            template_id: template_id.into(),
            os,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.template_id, self.os)
    }
}

/// Persisted state of one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub key: PoolKey,
    pub min: usize,
    /// Current upper bound, possibly raised by demand
    pub max: usize,
    /// Configured upper bound that `max` shrinks back to
    pub base_max: usize,
    pub ceiling: usize,
    /// Ready, unassigned workspace ids in hand-out order
    pub ready: Vec<String>,
    /// Pool-origin workspaces requested but not yet ready
    pub warming: Vec<String>,
    /// Total assignments served from or attempted against this pool
    pub demand: u64,
    pub updated_at: DateTime<Utc>,
}

impl PoolRecord {
    pub fn new(key: PoolKey, min: usize, max: usize, ceiling: usize, now: DateTime<Utc>) -> Self {
        Self {
            key,
            min,
            max,
            base_max: max,
            ceiling,
            ready: Vec::new(),
            warming: Vec::new(),
            demand: 0,
            updated_at: now,
        }
    }
}

/// Pool status summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub key: PoolKey,
    pub min: usize,
    pub max: usize,
    pub ceiling: usize,
    pub ready: usize,
    pub warming: usize,
    /// Assignments inside the trailing demand window
    pub recent_demand: usize,
    pub total_demand: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_display() {
        let key = PoolKey::new("bundle-gpu", OperatingSystem::Linux);
        assert_eq!(key.to_string(), "bundle-gpu/linux");
    }

    #[test]
    fn test_new_record_remembers_base_max() {
        let key = PoolKey::new("bundle-std", OperatingSystem::Windows);
        let record = PoolRecord::new(key, 5, 20, 40, Utc::now());
        assert_eq!(record.base_max, 20);
        assert!(record.ready.is_empty());
        assert_eq!(record.demand, 0);
    }
}
