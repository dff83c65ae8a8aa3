use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Serialize, Deserialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::Error;
use crate::lifecycle::state::{next_state, CertificateState, LifecycleEvent};
use crate::types::Result;

/// Default maximum number of issuance retries
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-certificate lifecycle record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// Current state
    pub state: CertificateState,
    /// Failed issuance attempts so far
    pub retry_count: u32,
    /// Expiration of the installed certificate, if any
    pub expires_at: Option<DateTime<Utc>>,
    /// Time of the last transition
    pub updated_at: DateTime<Utc>,
}

impl LifecycleRecord {
    fn new(state: CertificateState) -> Self {
        Self {
            state,
            retry_count: 0,
            expires_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Authoritative per-certificate state with serialized transitions.
///
/// Every id owns an async mutex; all transitions for that id go through it,
/// so a renewal and a manual revoke racing on the same certificate are
/// applied one after the other. Different ids never contend.
pub struct LifecycleStateMachine {
    /// id -> record
    records: DashMap<String, Arc<Mutex<LifecycleRecord>>>,
    /// Maximum FAILED -> REQUESTED retries
    max_retries: u32,
    /// How long before expiration a certificate becomes renewable
    renewal_threshold: Duration,
}

impl LifecycleStateMachine {
    /// Create a new state machine
    pub fn new(max_retries: u32, renewal_threshold: Duration) -> Self {
        Self {
            records: DashMap::new(),
            max_retries,
            renewal_threshold,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn renewal_threshold(&self) -> Duration {
        self.renewal_threshold
    }

    /// Whether a certificate expiring at `expires_at` is inside the renewal window
    pub fn is_renewal_due(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at - now <= self.renewal_threshold
    }

    /// Register a new certificate in REQUESTED
    pub fn register(&self, id: &str) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(id.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyExists(format!("certificate {}", id))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(LifecycleRecord::new(CertificateState::Requested))));
                debug!(id = %id, "Registered certificate in REQUESTED");
                Ok(())
            }
        }
    }

    /// Seed a record from persisted state
    pub fn restore(
        &self,
        id: &str,
        state: CertificateState,
        retry_count: u32,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let record = LifecycleRecord {
            state,
            retry_count,
            expires_at,
            updated_at: Utc::now(),
        };
        self.records.insert(id.to_string(), Arc::new(Mutex::new(record)));
    }

    /// Whether the id is known
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Drop the record for an id
    pub fn forget(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// Acquire the transition lock for an id
    pub async fn lock(&self, id: &str) -> Result<LifecycleGuard> {
        // Clone the Arc out so no map shard guard is held across the await
        let record = self
            .records
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("certificate {}", id)))?;

        Ok(LifecycleGuard {
            id: id.to_string(),
            record: record.lock_owned().await,
            max_retries: self.max_retries,
            renewal_threshold: self.renewal_threshold,
        })
    }

    /// Apply a single event under the id lock
    pub async fn transition(&self, id: &str, event: LifecycleEvent) -> Result<CertificateState> {
        self.transition_at(id, event, Utc::now()).await
    }

    /// Apply a single event at an explicit instant
    pub async fn transition_at(
        &self,
        id: &str,
        event: LifecycleEvent,
        now: DateTime<Utc>,
    ) -> Result<CertificateState> {
        let mut guard = self.lock(id).await?;
        guard.apply_at(event, now)
    }

    /// Copy of the current record
    pub async fn snapshot(&self, id: &str) -> Option<LifecycleRecord> {
        let record = self.records.get(id).map(|entry| entry.value().clone())?;
        let guard = record.lock().await;
        Some(guard.clone())
    }

    /// Ids currently in `state`
    pub async fn ids_in_state(&self, state: CertificateState) -> Vec<String> {
        let mut ids = Vec::new();
        for (id, record) in self.entries() {
            if record.lock().await.state == state {
                ids.push(id);
            }
        }
        ids
    }

    /// FAILED ids that still have retry budget
    pub async fn failed_with_retries_remaining(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for (id, record) in self.entries() {
            let record = record.lock().await;
            if record.state == CertificateState::Failed && record.retry_count < self.max_retries {
                ids.push(id);
            }
        }
        ids
    }

    /// Number of records per state
    pub async fn count_in_state(&self, state: CertificateState) -> usize {
        self.ids_in_state(state).await.len()
    }

    fn entries(&self) -> Vec<(String, Arc<Mutex<LifecycleRecord>>)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Exclusive access to one certificate's lifecycle record.
///
/// Holding the guard blocks every other transition for the same id, so a
/// caller can check an event, perform side effects (persist, call the CA),
/// and only then commit the transition.
pub struct LifecycleGuard {
    id: String,
    record: OwnedMutexGuard<LifecycleRecord>,
    max_retries: u32,
    renewal_threshold: Duration,
}

impl LifecycleGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CertificateState {
        self.record.state
    }

    pub fn retry_count(&self) -> u32 {
        self.record.retry_count
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.record.expires_at
    }

    pub fn record(&self) -> LifecycleRecord {
        self.record.clone()
    }

    /// Validate an event without applying it
    pub fn check(&self, event: LifecycleEvent) -> Result<CertificateState> {
        self.check_at(event, Utc::now())
    }

    /// Validate an event at an explicit instant
    pub fn check_at(&self, event: LifecycleEvent, now: DateTime<Utc>) -> Result<CertificateState> {
        let current = self.record.state;
        let next = next_state(current, &event).ok_or_else(|| self.invalid(event))?;

        match event {
            LifecycleEvent::Retry if self.record.retry_count >= self.max_retries => {
                return Err(Error::RetryLimitExceeded {
                    id: self.id.clone(),
                    retries: self.record.retry_count,
                    max_retries: self.max_retries,
                });
            }
            LifecycleEvent::BeginRenewal { force: false } => {
                if let Some(expires_at) = self.record.expires_at {
                    if expires_at - now > self.renewal_threshold {
                        return Err(Error::RenewalNotDue {
                            id: self.id.clone(),
                            expires_at,
                        });
                    }
                }
            }
            LifecycleEvent::RenewalSucceeded { expires_at } => {
                if let Some(current_expiry) = self.record.expires_at {
                    if expires_at < current_expiry {
                        return Err(Error::InvalidRequest(format!(
                            "renewed certificate for {} expires at {} which precedes current expiration {}",
                            self.id, expires_at, current_expiry
                        )));
                    }
                }
            }
            LifecycleEvent::Expire => match self.record.expires_at {
                Some(expires_at) if now >= expires_at => {}
                _ => return Err(self.invalid(event)),
            },
            _ => {}
        }

        Ok(next)
    }

    /// Apply an event
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<CertificateState> {
        self.apply_at(event, Utc::now())
    }

    /// Apply an event at an explicit instant
    pub fn apply_at(&mut self, event: LifecycleEvent, now: DateTime<Utc>) -> Result<CertificateState> {
        let previous = self.record.state;
        let next = self.check_at(event, now)?;

        match event {
            LifecycleEvent::ChallengeFailed => self.record.retry_count += 1,
            LifecycleEvent::Activate { expires_at } | LifecycleEvent::RenewalSucceeded { expires_at } => {
                self.record.expires_at = Some(expires_at);
            }
            _ => {}
        }
        self.record.state = next;
        self.record.updated_at = now;

        if next.is_terminal() {
            info!(id = %self.id, from = %previous, to = %next, event = %event, "Certificate reached terminal state");
        } else {
            debug!(id = %self.id, from = %previous, to = %next, event = %event, "Lifecycle transition");
        }

        Ok(next)
    }

    fn invalid(&self, event: LifecycleEvent) -> Error {
        Error::InvalidTransition {
            id: self.id.clone(),
            state: self.record.state,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> LifecycleStateMachine {
        LifecycleStateMachine::new(DEFAULT_MAX_RETRIES, Duration::days(30))
    }

    async fn activate(sm: &LifecycleStateMachine, id: &str, expires_at: DateTime<Utc>) {
        sm.register(id).unwrap();
        sm.transition(id, LifecycleEvent::BeginChallenge).await.unwrap();
        sm.transition(id, LifecycleEvent::ChallengeSucceeded).await.unwrap();
        sm.transition(id, LifecycleEvent::Activate { expires_at }).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_id() {
        let sm = machine();
        sm.register("cert-1").unwrap();
        assert!(matches!(sm.register("cert-1"), Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state_unchanged() {
        let sm = machine();
        sm.register("cert-1").unwrap();

        let err = sm.transition("cert-1", LifecycleEvent::Revoke).await.unwrap_err();
        match err {
            Error::InvalidTransition { state, event, .. } => {
                assert_eq!(state, CertificateState::Requested);
                assert_eq!(event, LifecycleEvent::Revoke);
            }
            other => panic!("unexpected error: {other}"),
        }

        let record = sm.snapshot("cert-1").await.unwrap();
        assert_eq!(record.state, CertificateState::Requested);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let sm = machine();
        sm.register("cert-1").unwrap();

        for attempt in 1..=DEFAULT_MAX_RETRIES {
            sm.transition("cert-1", LifecycleEvent::BeginChallenge).await.unwrap();
            sm.transition("cert-1", LifecycleEvent::ChallengeFailed).await.unwrap();
            let record = sm.snapshot("cert-1").await.unwrap();
            assert_eq!(record.retry_count, attempt);

            if attempt < DEFAULT_MAX_RETRIES {
                sm.transition("cert-1", LifecycleEvent::Retry).await.unwrap();
            }
        }

        let err = sm.transition("cert-1", LifecycleEvent::Retry).await.unwrap_err();
        assert!(matches!(err, Error::RetryLimitExceeded { retries: 3, max_retries: 3, .. }));
        assert_eq!(sm.snapshot("cert-1").await.unwrap().state, CertificateState::Failed);
        assert!(sm.failed_with_retries_remaining().await.is_empty());
    }

    #[tokio::test]
    async fn test_begin_renewal_requires_window_or_force() {
        let sm = machine();
        let now = Utc::now();
        activate(&sm, "cert-1", now + Duration::days(60)).await;

        let err = sm
            .transition_at("cert-1", LifecycleEvent::BeginRenewal { force: false }, now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RenewalNotDue { .. }));

        let state = sm
            .transition_at("cert-1", LifecycleEvent::BeginRenewal { force: true }, now)
            .await
            .unwrap();
        assert_eq!(state, CertificateState::Renewing);
    }

    #[tokio::test]
    async fn test_renewal_cannot_shorten_expiration() {
        let sm = machine();
        let now = Utc::now();
        activate(&sm, "cert-1", now + Duration::days(10)).await;
        sm.transition("cert-1", LifecycleEvent::BeginRenewal { force: false }).await.unwrap();

        let err = sm
            .transition("cert-1", LifecycleEvent::RenewalSucceeded { expires_at: now + Duration::days(5) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(sm.snapshot("cert-1").await.unwrap().state, CertificateState::Renewing);

        let new_expiry = now + Duration::days(90);
        sm.transition("cert-1", LifecycleEvent::RenewalSucceeded { expires_at: new_expiry })
            .await
            .unwrap();
        let record = sm.snapshot("cert-1").await.unwrap();
        assert_eq!(record.state, CertificateState::Active);
        assert_eq!(record.expires_at, Some(new_expiry));
    }

    #[tokio::test]
    async fn test_expire_only_after_expiration() {
        let sm = machine();
        let now = Utc::now();
        let expires_at = now + Duration::days(1);
        activate(&sm, "cert-1", expires_at).await;

        assert!(sm.transition_at("cert-1", LifecycleEvent::Expire, now).await.is_err());
        let state = sm
            .transition_at("cert-1", LifecycleEvent::Expire, expires_at)
            .await
            .unwrap();
        assert_eq!(state, CertificateState::Expired);

        // Terminal: nothing leaves EXPIRED
        assert!(sm.transition("cert-1", LifecycleEvent::BeginRenewal { force: true }).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_begin_renewal_only_one_wins() {
        let sm = Arc::new(machine());
        activate(&sm, "cert-1", Utc::now() + Duration::days(5)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sm = sm.clone();
            handles.push(tokio::spawn(async move {
                sm.transition("cert-1", LifecycleEvent::BeginRenewal { force: false }).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(CertificateState::Renewing) => winners += 1,
                Err(Error::InvalidTransition { state: CertificateState::Renewing, .. }) => {}
                other => panic!("unexpected outcome: {:?}", other.map_err(|e| e.to_string())),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_guard_serializes_check_and_apply() {
        let sm = machine();
        activate(&sm, "cert-1", Utc::now() + Duration::days(5)).await;

        let mut guard = sm.lock("cert-1").await.unwrap();
        assert_eq!(guard.check(LifecycleEvent::Revoke).unwrap(), CertificateState::Revoked);
        // Checking does not mutate
        assert_eq!(guard.state(), CertificateState::Active);
        guard.apply(LifecycleEvent::Revoke).unwrap();
        drop(guard);

        assert_eq!(sm.snapshot("cert-1").await.unwrap().state, CertificateState::Revoked);
    }

    #[tokio::test]
    async fn test_lock_unknown_id() {
        let sm = machine();
        assert!(matches!(sm.lock("missing").await, Err(Error::NotFound(_))));
    }
}
