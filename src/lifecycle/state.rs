use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Lifecycle state of a managed certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateState {
    /// Issuance requested, no challenge started yet
    Requested,
    /// ACME challenges in progress
    Issuing,
    /// Certificate obtained from the CA, not yet persisted
    Issued,
    /// Persisted and in service
    Active,
    /// Renewal in progress; current material still valid
    Renewing,
    /// Revoked at the CA
    Revoked,
    /// Past its expiration without a completed renewal
    Expired,
    /// Issuance attempt failed
    Failed,
}

impl CertificateState {
    /// No outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, CertificateState::Revoked | CertificateState::Expired)
    }

    /// States that hold issued certificate material
    pub fn holds_material(&self) -> bool {
        matches!(
            self,
            CertificateState::Active | CertificateState::Renewing | CertificateState::Revoked | CertificateState::Expired
        )
    }
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertificateState::Requested => "REQUESTED",
            CertificateState::Issuing => "ISSUING",
            CertificateState::Issued => "ISSUED",
            CertificateState::Active => "ACTIVE",
            CertificateState::Renewing => "RENEWING",
            CertificateState::Revoked => "REVOKED",
            CertificateState::Expired => "EXPIRED",
            CertificateState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Event driving a lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    BeginChallenge,
    ChallengeSucceeded,
    ChallengeFailed,
    Retry,
    /// Certificate persisted; installs its expiration
    Activate { expires_at: DateTime<Utc> },
    /// Start renewal; `force` bypasses the renewal window
    BeginRenewal { force: bool },
    /// Renewal persisted; installs the new expiration
    RenewalSucceeded { expires_at: DateTime<Utc> },
    RenewalFailed,
    Revoke,
    Expire,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::BeginChallenge => "begin_challenge",
            LifecycleEvent::ChallengeSucceeded => "challenge_succeeded",
            LifecycleEvent::ChallengeFailed => "challenge_failed",
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::Activate { .. } => "activate",
            LifecycleEvent::BeginRenewal { .. } => "begin_renewal",
            LifecycleEvent::RenewalSucceeded { .. } => "renewal_succeeded",
            LifecycleEvent::RenewalFailed => "renewal_failed",
            LifecycleEvent::Revoke => "revoke",
            LifecycleEvent::Expire => "expire",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transition table: the next state for `event` from `state`, or `None`
/// when the edge does not exist.
///
/// Guards that depend on data (retry budget, renewal window, expiration
/// instant) are evaluated by the state machine, not here.
pub fn next_state(state: CertificateState, event: &LifecycleEvent) -> Option<CertificateState> {
    use CertificateState::*;

    match (state, event) {
        (Requested, LifecycleEvent::BeginChallenge) => Some(Issuing),
        (Issuing, LifecycleEvent::ChallengeSucceeded) => Some(Issued),
        (Issuing, LifecycleEvent::ChallengeFailed) => Some(Failed),
        (Failed, LifecycleEvent::Retry) => Some(Requested),
        (Issued, LifecycleEvent::Activate { .. }) => Some(Active),
        (Active, LifecycleEvent::BeginRenewal { .. }) => Some(Renewing),
        (Renewing, LifecycleEvent::RenewalSucceeded { .. }) => Some(Active),
        (Renewing, LifecycleEvent::RenewalFailed) => Some(Active),
        (Active | Renewing, LifecycleEvent::Revoke) => Some(Revoked),
        (Active, LifecycleEvent::Expire) => Some(Expired),
        _ => None,
    }
}
