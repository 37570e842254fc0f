//! Tamper-evident audit ledger
//!
//! Every state-changing action appends an [`AuditEntry`] whose hash covers its
//! own fields and the previous entry's hash. Verification recomputes hashes
//! from the stored fields alone, so an edited row is detected even when the
//! storage layer's own bookkeeping looks fine.

use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::SharedClock;
use crate::models::{AuditEntry, AuditRecord, AuditResult, GENESIS_HASH};
use crate::store::Store;
use crate::{Error, Result};

pub struct AuditLedger {
    store: Arc<dyn Store>,
    clock: SharedClock,
    /// Serializes read-last-then-append
    append_lock: Mutex<()>,
}

/// Outcome of walking a range of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub from: u64,
    pub to: u64,
    /// Entries read from storage
    pub checked: usize,
    /// Entries before the first mismatch
    pub verified: usize,
    pub valid: bool,
    pub first_tampered: Option<u64>,
    /// The first tampered entry and everything after it in the range
    pub untrusted: Vec<u64>,
    pub reason: Option<String>,
}

/// An INITIATED entry awaiting its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTransition {
    pub actor: String,
    pub action: String,
    pub workspace_id: String,
    pub correlation_id: String,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn Store>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            append_lock: Mutex::new(()),
        }
    }

    /// Seal and store a record; returns the new entry's hash
    pub fn append(&self, record: AuditRecord) -> Result<String> {
        let _guard = self.append_lock.lock();
        let (seq, previous_hash) = match self.store.last_audit()? {
            Some(last) => (last.seq + 1, last.hash),
            None => (1, GENESIS_HASH.to_string()),
        };
        let entry = AuditEntry::seal(seq, self.clock.now(), record, &previous_hash);
        self.store.append_audit(&entry)?;
        tracing::debug!(
            seq = entry.seq,
            action = %entry.action,
            subject = %entry.subject_id,
            result = %entry.result,
            "Audit entry appended"
        );
        Ok(entry.hash)
    }

    /// Record the intent to perform `action` on a workspace.
    ///
    /// The returned handle writes the matching outcome entry; until it does,
    /// the transition shows up in [`AuditLedger::incomplete_transitions`].
    pub fn open_transition(
        &self,
        actor: &str,
        action: &str,
        workspace_id: &str,
        details: serde_json::Value,
    ) -> Result<OpenTransition> {
        let record = AuditRecord::workspace(actor, action, workspace_id, AuditResult::Initiated).details(details);
        let handle = OpenTransition {
            actor: record.actor.clone(),
            action: record.action.clone(),
            workspace_id: record.subject_id.clone(),
            correlation_id: record.correlation_id.clone(),
        };
        self.append(record)?;
        Ok(handle)
    }

    /// Write the outcome entry for an open transition
    pub fn close_transition(&self, handle: OpenTransition, result: AuditResult, details: serde_json::Value) -> Result<String> {
        self.append(
            AuditRecord::workspace(handle.actor, handle.action, handle.workspace_id, result)
                .correlation(handle.correlation_id)
                .details(details),
        )
    }

    pub fn len(&self) -> Result<u64> {
        self.store.audit_len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Hash of the newest entry, or the genesis value for an empty ledger
    pub fn head_hash(&self) -> Result<String> {
        Ok(self
            .store
            .last_audit()?
            .map(|e| e.hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string()))
    }

    pub fn entries(&self, range: RangeInclusive<u64>) -> Result<Vec<AuditEntry>> {
        self.store.audit_range(*range.start(), *range.end())
    }

    pub fn entries_for_subject(&self, subject_id: &str) -> Result<Vec<AuditEntry>> {
        self.store.audit_for_subject(subject_id)
    }

    /// Walk a contiguous range, recomputing every hash. Read-only.
    pub fn verify(&self, range: RangeInclusive<u64>) -> Result<VerifyReport> {
        let from = (*range.start()).max(1);
        let to = *range.end();
        let entries = self.store.audit_range(from, to)?;

        let mut expected_prev = if from == 1 {
            GENESIS_HASH.to_string()
        } else {
            match self.store.audit_range(from - 1, from - 1)?.pop() {
                Some(pred) => pred.hash,
                None => {
                    return Ok(VerifyReport {
                        from,
                        to,
                        checked: entries.len(),
                        verified: 0,
                        valid: entries.is_empty(),
                        first_tampered: entries.first().map(|e| e.seq),
                        untrusted: entries.iter().map(|e| e.seq).collect(),
                        reason: (!entries.is_empty()).then(|| format!("entry {} missing", from - 1)),
                    })
                }
            }
        };

        let mut expected_seq = from;
        let mut failure: Option<(u64, usize, String)> = None;
        for (idx, entry) in entries.iter().enumerate() {
            let problem = if entry.seq != expected_seq {
                Some((expected_seq, format!("entry {expected_seq} missing")))
            } else if entry.previous_hash != expected_prev {
                Some((entry.seq, format!("entry {} does not link to its predecessor", entry.seq)))
            } else if entry.compute_hash(&entry.previous_hash) != entry.hash {
                Some((entry.seq, format!("entry {} hash mismatch", entry.seq)))
            } else {
                None
            };

            if let Some((seq, reason)) = problem {
                failure = Some((seq, idx, reason));
                break;
            }
            expected_prev = entry.hash.clone();
            expected_seq += 1;
        }

        let report = match failure {
            None => VerifyReport {
                from,
                to,
                checked: entries.len(),
                verified: entries.len(),
                valid: true,
                first_tampered: None,
                untrusted: Vec::new(),
                reason: None,
            },
            Some((seq, idx, reason)) => {
                let mut untrusted = vec![seq];
                untrusted.extend(entries[idx..].iter().map(|e| e.seq).filter(|s| *s != seq));
                tracing::warn!(first_tampered = seq, %reason, "Audit chain verification failed");
                VerifyReport {
                    from,
                    to,
                    checked: entries.len(),
                    verified: idx,
                    valid: false,
                    first_tampered: Some(seq),
                    untrusted,
                    reason: Some(reason),
                }
            }
        };
        Ok(report)
    }

    pub fn verify_all(&self) -> Result<VerifyReport> {
        let len = self.len()?;
        self.verify(1..=len.max(1))
    }

    /// Fail with [`Error::IntegrityViolation`] when any entry is tampered
    pub fn ensure_intact(&self) -> Result<()> {
        match self.verify_all()?.first_tampered {
            Some(first_tampered) => Err(Error::IntegrityViolation { first_tampered }),
            None => Ok(()),
        }
    }

    /// INITIATED entries with no SUCCESS or FAILURE sharing their correlation id.
    ///
    /// These are transitions interrupted between the intent record and the
    /// outcome record, e.g. by a crash mid-call.
    pub fn incomplete_transitions(&self) -> Result<Vec<AuditEntry>> {
        self.store.audit_open_transitions()
    }
}
