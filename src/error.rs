use std::io;
use thiserror::Error;

use crate::acme::ChallengeType;
use crate::lifecycle::{CertificateState, LifecycleEvent};

/// Generic error type
#[derive(Error, Debug)]
pub enum Error {
    /// Event not allowed from the current lifecycle state
    #[error("Invalid transition for certificate {id}: cannot apply '{event}' in state {state}")]
    InvalidTransition {
        id: String,
        state: CertificateState,
        event: LifecycleEvent,
    },

    /// One or more domains failed ACME validation
    #[error("Challenge validation failed ({challenge_type}) for {}: {detail}", .domains.join(", "))]
    ChallengeValidationFailed {
        challenge_type: ChallengeType,
        domains: Vec<String>,
        detail: String,
    },

    /// Validation did not complete in time
    #[error("Challenge timed out after {timeout_secs}s ({challenge_type}) for {}", .domains.join(", "))]
    ChallengeTimeout {
        challenge_type: ChallengeType,
        domains: Vec<String>,
        timeout_secs: u64,
    },

    /// Store backend I/O failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unrecoverable store failure (corrupt data, permissions)
    #[error("Store corrupted: {0}")]
    StoreCorrupted(String),

    /// CA rejected a revocation
    #[error("Revocation failed for certificate {id}: {reason}")]
    RevocationFailed { id: String, reason: String },

    /// Retry budget exhausted
    #[error("Retry limit reached for certificate {id} ({retries}/{max_retries})")]
    RetryLimitExceeded {
        id: String,
        retries: u32,
        max_retries: u32,
    },

    /// Renewal already running for this id
    #[error("Renewal already in progress for certificate {0}")]
    RenewalInProgress(String),

    /// Renewal requested outside the renewal window
    #[error("Renewal not due for certificate {id} (expires at {expires_at})")]
    RenewalNotDue {
        id: String,
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// ACME client error
    #[error("ACME error: {0}")]
    Acme(String),

    /// DNS provider error
    #[error("DNS provider error: {0}")]
    Dns(String),

    /// Cloud certificate store error
    #[error("Cloud store error: {0}")]
    CloudStore(String),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ChallengeValidationFailed { .. }
                | Error::ChallengeTimeout { .. }
                | Error::StoreUnavailable(_)
                | Error::Acme(_)
                | Error::Dns(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(err: rcgen::RcgenError) -> Self {
        Error::Crypto(format!("Certificate request generation failed: {}", err))
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Internal(format!("Metrics error: {}", err))
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Internal(err)
    }
}
