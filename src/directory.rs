//! Directory join with bounded polling

use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::DirectoryConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStatus {
    Joined,
    Pending,
    Failed(String),
}

/// Directory/identity service a workspace joins during customization
#[cfg_attr(test, mockall::automock)]
pub trait DirectoryService: Send + Sync {
    /// Start (or re-request) the join; idempotent per workspace
    fn request_join(&self, workspace_id: &str, remote_id: &str) -> Result<JoinStatus>;

    fn join_status(&self, workspace_id: &str) -> Result<JoinStatus>;
}

/// Directory service that joins immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDirectory;

impl DirectoryService for NoopDirectory {
    fn request_join(&self, _: &str, _: &str) -> Result<JoinStatus> {
        Ok(JoinStatus::Joined)
    }

    fn join_status(&self, _: &str) -> Result<JoinStatus> {
        Ok(JoinStatus::Joined)
    }
}

pub struct DirectoryJoiner {
    service: Arc<dyn DirectoryService>,
    clock: SharedClock,
    max_attempts: u32,
    poll_interval: Duration,
}

impl DirectoryJoiner {
    pub fn new(service: Arc<dyn DirectoryService>, config: &DirectoryConfig, clock: SharedClock) -> Self {
        Self {
            service,
            clock,
            max_attempts: config.max_attempts.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Join and poll until joined.
    ///
    /// A `Failed` status is permanent. Running out of attempts while still
    /// pending is transient so the caller can try again later.
    pub fn join(&self, workspace_id: &str, remote_id: &str) -> Result<()> {
        let mut status = self.service.request_join(workspace_id, remote_id)?;
        let mut attempt = 1;
        loop {
            match status {
                JoinStatus::Joined => {
                    tracing::info!(instance = %workspace_id, attempts = attempt, "Directory join complete");
                    return Ok(());
                }
                JoinStatus::Failed(reason) => {
                    return Err(Error::Permanent(format!("directory join failed for {workspace_id}: {reason}")));
                }
                JoinStatus::Pending if attempt >= self.max_attempts => {
                    return Err(Error::Transient(format!(
                        "directory join for {workspace_id} still pending after {attempt} attempts"
                    )));
                }
                JoinStatus::Pending => {
                    self.clock.sleep(self.poll_interval);
                    attempt += 1;
                    status = match self.service.join_status(workspace_id) {
                        Ok(s) => s,
                        Err(e) if e.is_retryable() => {
                            tracing::debug!(instance = %workspace_id, error = %e, "Join status unavailable");
                            JoinStatus::Pending
                        }
                        Err(e) => return Err(e),
                    };
                }
            }
        }
    }
}
