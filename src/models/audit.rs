//! Audit entry model

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Chain anchor for the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    /// Recorded before the control-plane call is issued
    Initiated,
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Initiated => "INITIATED",
            AuditResult::Success => "SUCCESS",
            AuditResult::Failure => "FAILURE",
        }
    }
}

impl std::str::FromStr for AuditResult {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(AuditResult::Initiated),
            "SUCCESS" => Ok(AuditResult::Success),
            "FAILURE" => Ok(AuditResult::Failure),
            other => Err(crate::Error::Config(format!("unknown audit result: {other}"))),
        }
    }
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields supplied by the component performing an action
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub actor: String,
    pub action: String,
    pub subject_type: String,
    pub subject_id: String,
    pub result: AuditResult,
    /// Ties the INITIATED entry of a transition to its outcome
    pub correlation_id: String,
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            result,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            details: serde_json::Value::Null,
        }
    }

    /// Audit record about a workspace
    pub fn workspace(
        actor: impl Into<String>,
        action: impl Into<String>,
        workspace_id: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self::new(actor, action, "workspace", workspace_id, result)
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Immutable, hash-linked ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 1
    pub seq: u64,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub subject_type: String,
    pub subject_id: String,
    pub result: AuditResult,
    pub correlation_id: String,
    pub details: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    pub fn seal(seq: u64, timestamp: DateTime<Utc>, record: AuditRecord, previous_hash: &str) -> Self {
        let mut entry = Self {
            seq,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            actor: record.actor,
            action: record.action,
            subject_type: record.subject_type,
            subject_id: record.subject_id,
            result: record.result,
            correlation_id: record.correlation_id,
            details: record.details,
            previous_hash: previous_hash.to_string(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash(previous_hash);
        entry
    }

    /// SHA-256 over the stored fields followed by `previous_hash`.
    ///
    /// Each field is fed as a big-endian `u64` byte length and then its
    /// bytes, so text cannot move across a field boundary unnoticed.
    pub fn compute_hash(&self, previous_hash: &str) -> String {
        let seq = self.seq.to_string();
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let details = self.details.to_string();
        let fields: [&str; 11] = [
            &seq,
            &self.id,
            &timestamp,
            &self.actor,
            &self.action,
            &self.subject_type,
            &self.subject_id,
            self.result.as_str(),
            &self.correlation_id,
            &details,
            previous_hash,
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn is_self_consistent(&self) -> bool {
        self.compute_hash(&self.previous_hash) == self.hash
    }
}
