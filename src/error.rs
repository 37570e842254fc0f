//! Error types for the provisioning engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Network or 5xx-equivalent failure; retried with backoff by the client
    #[error("Transient control-plane failure: {0}")]
    Transient(String),

    #[error("Circuit open for {endpoint}: failing fast")]
    CircuitOpen { endpoint: String },

    /// Validation or permission failure; never retried
    #[error("Permanent control-plane failure: {0}")]
    Permanent(String),

    #[error("Partial failure on {instance_id} during {step}: {cause}")]
    PartialFailure {
        instance_id: String,
        step: String,
        cause: String,
    },

    #[error("Audit chain integrity violation at entry {first_tampered}")]
    IntegrityViolation { first_tampered: u64 },

    #[error("Workspace not found: {0}")]
    InstanceNotFound(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Invalid state: workspace is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Workspace {0} has an action in flight")]
    InstanceBusy(String),

    #[error("Workspace {instance_id} not ready after {waited_secs}s")]
    ProvisioningTimeout { instance_id: String, waited_secs: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the retry policy may attempt the call again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Stable short name recorded in audit details
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transient(_) => "transient",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Permanent(_) => "permanent",
            Error::PartialFailure { .. } => "partial_failure",
            Error::IntegrityViolation { .. } => "integrity_violation",
            Error::InstanceNotFound(_) => "instance_not_found",
            Error::PoolNotFound(_) => "pool_not_found",
            Error::InvalidState { .. } => "invalid_state",
            Error::InstanceBusy(_) => "instance_busy",
            Error::ProvisioningTimeout { .. } => "provisioning_timeout",
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    pub fn invalid_state(current: impl ToString, expected: impl Into<String>) -> Self {
        Error::InvalidState {
            current: current.to_string(),
            expected: expected.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(Error::Transient("503".into()).is_retryable());
        assert!(!Error::Permanent("403".into()).is_retryable());
        assert!(!Error::CircuitOpen { endpoint: "cp".into() }.is_retryable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Error::InstanceBusy("ws-1".into()).kind(), "instance_busy");
        assert_eq!(
            Error::IntegrityViolation { first_tampered: 3 }.kind(),
            "integrity_violation"
        );
    }
}
