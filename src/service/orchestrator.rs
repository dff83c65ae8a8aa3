use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::acme::{create_acme_client, AcmeClient, ChallengeType, IssuedCertificate, RevocationReason};
use crate::challenge::{create_dns_provider, ChallengeCoordinator, Http01Responder};
use crate::cloud::CloudAdapterRegistry;
use crate::config::Settings;
use crate::controller::health::HealthReport;
use crate::crypto::generate_csr;
use crate::domain::{Certificate, CertificateSummary, IssueRequest, SubjectInfo};
use crate::error::Error;
use crate::lifecycle::{CertificateState, LifecycleEvent, LifecycleGuard, LifecycleStateMachine};
use crate::propagation::{PropagationEngine, PropagationResult, PropagationStrategy, RegionConfig};
use crate::store::{create_certificate_store, CertificateFilter, CertificateStore};
use crate::telemetry::MetricsCollector;
use crate::types::{KeyAlgorithm, Result};

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Per-domain validation timeout
    pub challenge_timeout: Duration,
    pub default_key_algorithm: KeyAlgorithm,
    /// Propagate to `default_regions` after every activation and renewal
    pub auto_propagate: bool,
    pub default_strategy: PropagationStrategy,
    pub default_regions: Vec<RegionConfig>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            challenge_timeout: Duration::from_secs(300),
            default_key_algorithm: KeyAlgorithm::default(),
            auto_propagate: false,
            default_strategy: PropagationStrategy::default(),
            default_regions: Vec::new(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            challenge_timeout: settings.challenge_timeout(),
            default_key_algorithm: settings.lifecycle.default_key_algorithm,
            auto_propagate: settings.propagation.auto_propagate,
            default_strategy: settings.propagation.default_strategy,
            default_regions: settings.propagation.regions.clone(),
        }
    }
}

/// Material returned by the CA together with the key that signed the CSR
#[derive(Clone)]
struct IssuedMaterial {
    issued: IssuedCertificate,
    private_key_pem: String,
    key_algorithm: KeyAlgorithm,
    challenge_type: ChallengeType,
}

/// A certificate that has not reached the store yet
#[derive(Clone)]
struct PendingIssuance {
    request: IssueRequest,
    challenge_type: ChallengeType,
    key_algorithm: KeyAlgorithm,
    /// Set once the CA has issued; consumed by activation
    material: Option<IssuedMaterial>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl PendingIssuance {
    fn summary(&self, id: &str, state: CertificateState, retry_count: u32) -> CertificateSummary {
        let (issued_at, expires_at, certificate_pem, chain_pem) = match &self.material {
            Some(material) => (
                Some(material.issued.not_before),
                Some(material.issued.not_after),
                Some(material.issued.certificate_pem.clone()),
                material.issued.chain_pem.clone(),
            ),
            None => (None, None, None, None),
        };

        CertificateSummary {
            id: id.to_string(),
            domains: self.request.domains.clone(),
            state,
            issued_at,
            expires_at,
            certificate_pem,
            chain_pem,
            key_algorithm: self.key_algorithm,
            key_size: self.key_algorithm.key_size(),
            subject: self.request.subject.clone(),
            auto_renew: self.request.auto_renew,
            challenge_type: self.challenge_type,
            retry_count,
            revocation_reason: None,
            external_handles: Default::default(),
            updated_at: self.created_at,
        }
    }
}

/// State writes done or still owed by a pass over many certificates
#[derive(Debug, Default)]
pub struct PersistReport {
    /// Ids whose new state reached the store
    pub written: Vec<String>,
    /// id -> store error; the state change is kept and written later
    pub failures: Vec<(String, Error)>,
}

/// Certificate lifecycle facade.
///
/// Issue, renew, revoke and propagate all go through here. The lifecycle
/// state machine is the authority on state; the store only ever sees
/// certificates that reached ACTIVE, plus their later transitions.
/// Certificates still on their way to ACTIVE are held in memory.
pub struct CertificateOrchestrator {
    acme: Arc<dyn AcmeClient>,
    coordinator: Arc<ChallengeCoordinator>,
    store: Arc<dyn CertificateStore>,
    lifecycle: Arc<LifecycleStateMachine>,
    propagation: Arc<PropagationEngine>,
    metrics: Arc<MetricsCollector>,
    options: OrchestratorOptions,
    /// id -> issuance not yet persisted
    pending: DashMap<String, PendingIssuance>,
    /// id -> REVOKED or EXPIRED record the store rejected
    unpersisted: DashMap<String, Certificate>,
}

impl CertificateOrchestrator {
    pub fn new(
        acme: Arc<dyn AcmeClient>,
        coordinator: Arc<ChallengeCoordinator>,
        store: Arc<dyn CertificateStore>,
        lifecycle: Arc<LifecycleStateMachine>,
        propagation: Arc<PropagationEngine>,
        metrics: Arc<MetricsCollector>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            acme,
            coordinator,
            store,
            lifecycle,
            propagation,
            metrics,
            options,
            pending: DashMap::new(),
            unpersisted: DashMap::new(),
        }
    }

    /// Build every component from settings and restore persisted state
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new(settings.telemetry.enable_metrics)?);
        let acme = create_acme_client(settings)?;
        let dns = create_dns_provider(settings)?;

        let coordinator = ChallengeCoordinator::new(acme.clone(), dns, Http01Responder::new())
            .with_max_concurrency(settings.challenge.max_concurrency)
            .with_poll_interval(Duration::from_millis(settings.challenge.poll_interval_ms))
            .with_dns_propagation_delay(Duration::from_secs(settings.challenge.dns_propagation_delay_secs))
            .with_dns_zone(settings.challenge.dns_zone.clone());

        let registry = if settings.propagation.simulate_backends {
            CloudAdapterRegistry::simulated()
        } else {
            CloudAdapterRegistry::new()
        };

        let store = create_certificate_store(settings, &registry).await?;
        let lifecycle = Arc::new(LifecycleStateMachine::new(
            settings.lifecycle.max_retries,
            settings.renewal_threshold(),
        ));
        let propagation = PropagationEngine::new(
            store.clone(),
            registry,
            settings.propagation.max_concurrency,
            settings.region_timeout(),
        )
        .with_metrics(metrics.clone());

        let orchestrator = Self::new(
            acme,
            Arc::new(coordinator),
            store,
            lifecycle,
            Arc::new(propagation),
            metrics,
            OrchestratorOptions::from_settings(settings),
        );
        orchestrator.restore().await?;
        Ok(orchestrator)
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleStateMachine> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn propagation(&self) -> &Arc<PropagationEngine> {
        &self.propagation
    }

    /// Token table served by the HTTP-01 listener
    pub fn challenge_responder(&self) -> Http01Responder {
        self.coordinator.http_responder().clone()
    }

    /// Seed the state machine from the store.
    ///
    /// Ids the state machine already tracks are left alone.
    pub(crate) async fn restore(&self) -> Result<usize> {
        let certificates = self.store.list(&CertificateFilter::all()).await?;
        let mut restored = 0;
        for certificate in &certificates {
            if self.lifecycle.contains(&certificate.id) {
                continue;
            }
            // A renewal interrupted by a restart left the old material in place
            let state = match certificate.state {
                CertificateState::Renewing => CertificateState::Active,
                state => state,
            };
            self.lifecycle.restore(
                &certificate.id,
                state,
                certificate.retry_count,
                Some(certificate.expires_at),
            );
            restored += 1;
        }

        info!(count = restored, backend = self.store.backend_name(), "Restored certificates");
        Ok(restored)
    }

    /// Issue a new certificate.
    ///
    /// Runs one attempt: on failure the certificate is left FAILED with its
    /// retry count incremented and the error is returned.
    pub async fn issue(&self, request: IssueRequest) -> Result<Certificate> {
        let request = request.normalize()?;
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match self.store.get(&id).await {
            Ok(_) => return Err(Error::AlreadyExists(format!("certificate {}", id))),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.lifecycle.register(&id)?;

        let challenge_type = request.effective_challenge_type();
        let key_algorithm = request.key_algorithm.unwrap_or(self.options.default_key_algorithm);
        self.pending.insert(
            id.clone(),
            PendingIssuance {
                request,
                challenge_type,
                key_algorithm,
                material: None,
                last_error: None,
                created_at: Utc::now(),
            },
        );

        info!(id = %id, challenge_type = %challenge_type, "Issuance requested");

        let guard = self.lifecycle.lock(&id).await?;
        let certificate = self.attempt_issuance(guard).await?;
        self.auto_propagate(&certificate.id).await;
        Ok(certificate)
    }

    /// Retry a FAILED issuance, or finish activating an ISSUED one
    pub async fn retry_issuance(&self, id: &str) -> Result<Certificate> {
        let mut guard = self.lifecycle.lock(id).await?;

        let certificate = if guard.state() == CertificateState::Issued {
            self.activate(&mut guard).await?
        } else {
            guard.apply(LifecycleEvent::Retry)?;
            info!(id = %id, retry_count = guard.retry_count(), "Retrying issuance");
            self.attempt_issuance(guard).await?
        };

        self.auto_propagate(&certificate.id).await;
        Ok(certificate)
    }

    /// Persist and activate an ISSUED certificate whose activation failed earlier
    pub async fn resume_activation(&self, id: &str) -> Result<Certificate> {
        let mut guard = self.lifecycle.lock(id).await?;
        let certificate = self.activate(&mut guard).await?;
        drop(guard);
        self.auto_propagate(&certificate.id).await;
        Ok(certificate)
    }

    /// One issuance attempt from REQUESTED
    async fn attempt_issuance(&self, mut guard: LifecycleGuard) -> Result<Certificate> {
        let id = guard.id().to_string();
        let pending = self
            .pending
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("pending issuance {}", id)))?;

        guard.apply(LifecycleEvent::BeginChallenge)?;

        // Release the lock while the challenge runs; ISSUING keeps other
        // attempts out and lets readers see the state.
        drop(guard);

        let outcome = self
            .obtain(
                &pending.request.domains,
                pending.challenge_type,
                pending.key_algorithm,
                &pending.request.subject,
            )
            .await;

        let mut guard = self.lifecycle.lock(&id).await?;
        match outcome {
            Ok(material) => {
                guard.apply(LifecycleEvent::ChallengeSucceeded)?;
                if let Some(mut entry) = self.pending.get_mut(&id) {
                    entry.material = Some(material);
                    entry.last_error = None;
                }
                self.activate(&mut guard).await
            }
            Err(e) => {
                guard.apply(LifecycleEvent::ChallengeFailed)?;
                if let Some(mut entry) = self.pending.get_mut(&id) {
                    entry.last_error = Some(e.to_string());
                }
                self.metrics.record_issuance(false);
                warn!(id = %id, retry_count = guard.retry_count(), error = %e, "Issuance failed");
                Err(e)
            }
        }
    }

    /// ISSUED -> ACTIVE: persist first, then transition.
    ///
    /// A store failure leaves the certificate ISSUED with its material kept
    /// in memory so a later sweep can finish the job.
    async fn activate(&self, guard: &mut LifecycleGuard) -> Result<Certificate> {
        let id = guard.id().to_string();
        let pending = self
            .pending
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("pending issuance {}", id)))?;
        let material = pending
            .material
            .clone()
            .ok_or_else(|| Error::Internal(format!("Certificate {} has no issued material", id)))?;

        let expires_at = material.issued.not_after;
        guard.check(LifecycleEvent::Activate { expires_at })?;

        let certificate = Certificate {
            id: id.clone(),
            domains: pending.request.domains.clone(),
            issued_at: material.issued.not_before,
            expires_at,
            certificate_pem: material.issued.certificate_pem.clone(),
            chain_pem: material.issued.chain_pem.clone(),
            private_key_pem: material.private_key_pem.clone(),
            key_algorithm: material.key_algorithm,
            key_size: material.key_algorithm.key_size(),
            subject: pending.request.subject.clone(),
            auto_renew: pending.request.auto_renew,
            state: CertificateState::Active,
            challenge_type: material.challenge_type,
            retry_count: guard.retry_count(),
            revocation_reason: None,
            external_handles: Default::default(),
            updated_at: Utc::now(),
        };

        let stored = match self.store.put(&certificate).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(id = %id, error = %e, "Failed to persist issued certificate; activation deferred");
                return Err(e);
            }
        };

        guard.apply(LifecycleEvent::Activate { expires_at })?;
        self.pending.remove(&id);
        self.metrics.record_issuance(true);
        info!(id = %id, expires_at = %expires_at, "Certificate active");
        Ok(stored)
    }

    /// Validate every domain, then finalize a fresh CSR with the CA
    async fn obtain(
        &self,
        domains: &[String],
        challenge_type: ChallengeType,
        key_algorithm: KeyAlgorithm,
        subject: &SubjectInfo,
    ) -> Result<IssuedMaterial> {
        let validation = self
            .coordinator
            .validate(domains, challenge_type, self.options.challenge_timeout)
            .await?;
        for outcome in &validation.outcomes {
            self.metrics.record_challenge(challenge_type, outcome.status);
        }
        validation.into_result()?;

        let csr = generate_csr(domains, subject, key_algorithm)?;
        let issued = self.acme.finalize(&csr.csr_pem, domains).await?;
        if issued.not_after <= issued.not_before {
            return Err(Error::Acme(format!(
                "CA returned a certificate expiring at {} before its start {}",
                issued.not_after, issued.not_before
            )));
        }

        debug!(domains = ?domains, not_after = %issued.not_after, "Certificate finalized");
        Ok(IssuedMaterial {
            issued,
            private_key_pem: csr.private_key_pem,
            key_algorithm: csr.key_algorithm,
            challenge_type,
        })
    }

    /// Renew an ACTIVE certificate.
    ///
    /// Without `force` the certificate must be inside the renewal window.
    /// The id, domains and subject are kept; key and certificate are new.
    pub async fn renew(&self, id: &str, force: bool) -> Result<Certificate> {
        let current = self.store.get(id).await?;

        {
            let mut guard = self.lifecycle.lock(id).await?;
            match guard.apply(LifecycleEvent::BeginRenewal { force }) {
                Ok(_) => {}
                Err(Error::InvalidTransition { state: CertificateState::Renewing, .. }) => {
                    return Err(Error::RenewalInProgress(id.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        info!(id = %id, force, expires_at = %current.expires_at, "Renewing certificate");

        let challenge_type = match current.challenge_type {
            ChallengeType::Http01 if crate::domain::has_wildcard(&current.domains) => ChallengeType::Dns01,
            challenge_type => challenge_type,
        };
        let outcome = self
            .obtain(&current.domains, challenge_type, current.key_algorithm, &current.subject)
            .await;

        let mut guard = self.lifecycle.lock(id).await?;
        let result = match outcome {
            Ok(material) => self.install_renewal(&mut guard, current, material).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(renewed) => {
                self.metrics.record_renewal(true);
                info!(id = %id, expires_at = %renewed.expires_at, "Certificate renewed");
                drop(guard);
                self.auto_propagate(id).await;
                Ok(renewed)
            }
            Err(e) => {
                // A revoke may have landed while the challenge ran
                if guard.state() == CertificateState::Renewing {
                    guard.apply(LifecycleEvent::RenewalFailed)?;
                }
                self.metrics.record_renewal(false);
                warn!(id = %id, error = %e, "Renewal failed");
                Err(e)
            }
        }
    }

    async fn install_renewal(
        &self,
        guard: &mut LifecycleGuard,
        current: Certificate,
        material: IssuedMaterial,
    ) -> Result<Certificate> {
        let expires_at = material.issued.not_after;
        guard.check(LifecycleEvent::RenewalSucceeded { expires_at })?;

        let renewed = Certificate {
            issued_at: material.issued.not_before,
            expires_at,
            certificate_pem: material.issued.certificate_pem,
            chain_pem: material.issued.chain_pem,
            private_key_pem: material.private_key_pem,
            key_algorithm: material.key_algorithm,
            key_size: material.key_algorithm.key_size(),
            challenge_type: material.challenge_type,
            state: CertificateState::Active,
            updated_at: Utc::now(),
            ..current
        };

        let stored = self.store.put(&renewed).await?;
        guard.apply(LifecycleEvent::RenewalSucceeded { expires_at })?;
        Ok(stored)
    }

    /// Revoke with the CA, then record REVOKED (or delete with `purge`).
    ///
    /// A CA rejection leaves the certificate ACTIVE.
    pub async fn revoke(&self, id: &str, reason: RevocationReason, purge: bool) -> Result<Certificate> {
        let mut guard = self.lifecycle.lock(id).await?;
        guard.check(LifecycleEvent::Revoke)?;

        let current = self.store.get(id).await?;
        if let Err(e) = self.acme.revoke(&current.certificate_pem, reason).await {
            self.metrics.record_revocation(false);
            warn!(id = %id, reason = %reason, error = %e, "CA rejected revocation");
            return Err(Error::RevocationFailed {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }

        guard.apply(LifecycleEvent::Revoke)?;
        self.metrics.record_revocation(true);

        let revoked = Certificate {
            state: CertificateState::Revoked,
            revocation_reason: Some(reason),
            updated_at: Utc::now(),
            ..current
        };

        if purge {
            if let Err(e) = self.store.delete(id).await {
                // The CA already acted; keep REVOKED so a later write records it
                self.unpersisted.insert(id.to_string(), revoked);
                return Err(e);
            }
            drop(guard);
            self.lifecycle.forget(id);
            info!(id = %id, reason = %reason, "Certificate revoked and purged");
            return Ok(revoked);
        }

        match self.store.put(&revoked).await {
            Ok(stored) => {
                info!(id = %id, reason = %reason, code = reason.code(), "Certificate revoked");
                Ok(stored)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Revocation not persisted; will write it again");
                self.unpersisted.insert(id.to_string(), revoked);
                Err(e)
            }
        }
    }

    /// Move every ACTIVE certificate past its expiration to EXPIRED.
    ///
    /// An expiration the store rejects still takes effect in the state
    /// machine; it is reported as a failure and written by
    /// [`Self::flush_unpersisted`].
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<PersistReport> {
        let candidates = self
            .store
            .list(&CertificateFilter::in_state(CertificateState::Active))
            .await?;

        let mut report = PersistReport::default();
        for certificate in candidates.into_iter().filter(|c| c.is_expired_at(now)) {
            let mut guard = match self.lifecycle.lock(&certificate.id).await {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            if let Err(e) = guard.apply_at(LifecycleEvent::Expire, now) {
                debug!(id = %certificate.id, error = %e, "Not expiring certificate");
                continue;
            }

            let id = certificate.id.clone();
            let record = Certificate {
                state: CertificateState::Expired,
                updated_at: Utc::now(),
                ..certificate
            };
            match self.store.put(&record).await {
                Ok(_) => {
                    info!(id = %id, "Certificate expired");
                    report.written.push(id);
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Expiration not persisted; will write it again");
                    self.unpersisted.insert(id.clone(), record);
                    report.failures.push((id, e));
                }
            }
        }

        Ok(report)
    }

    /// Write REVOKED and EXPIRED records the store rejected earlier
    pub async fn flush_unpersisted(&self) -> PersistReport {
        let mut report = PersistReport::default();
        let ids: Vec<String> = self.unpersisted.iter().map(|entry| entry.key().clone()).collect();

        for id in ids {
            let guard = match self.lifecycle.lock(&id).await {
                Ok(guard) => guard,
                Err(_) => {
                    // Forgotten since; nothing left to record
                    self.unpersisted.remove(&id);
                    continue;
                }
            };
            let Some(record) = self.unpersisted.get(&id).map(|entry| entry.value().clone()) else {
                continue;
            };
            if record.state != guard.state() {
                self.unpersisted.remove(&id);
                continue;
            }

            match self.store.put(&record).await {
                Ok(_) => {
                    self.unpersisted.remove(&id);
                    info!(id = %id, state = %record.state, "Persisted deferred state change");
                    report.written.push(id);
                }
                Err(e) => {
                    warn!(id = %id, state = %record.state, error = %e, "Deferred state change still not persisted");
                    report.failures.push((id, e));
                }
            }
        }

        report
    }

    /// Ids with a state change the store has not accepted yet
    pub fn unpersisted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.unpersisted.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Replicate a certificate; defaults come from configuration
    pub async fn propagate(
        &self,
        id: &str,
        strategy: Option<PropagationStrategy>,
        regions: Option<Vec<RegionConfig>>,
    ) -> Result<PropagationResult> {
        let state = self
            .lifecycle
            .snapshot(id)
            .await
            .map(|record| record.state)
            .ok_or_else(|| Error::NotFound(format!("certificate {}", id)))?;
        if !matches!(state, CertificateState::Active | CertificateState::Renewing) {
            return Err(Error::InvalidRequest(format!(
                "Certificate {} is {} and cannot be propagated",
                id, state
            )));
        }

        let strategy = strategy.unwrap_or(self.options.default_strategy);
        let regions = regions.unwrap_or_else(|| self.options.default_regions.clone());
        self.propagation.propagate(id, strategy, &regions).await
    }

    pub fn propagation_status(&self, task_id: &str) -> Result<PropagationResult> {
        self.propagation.status(task_id)
    }

    pub async fn wait_propagation(&self, task_id: &str) -> Result<PropagationResult> {
        self.propagation.wait(task_id).await
    }

    pub fn cancel_propagation(&self, task_id: &str) -> Result<PropagationResult> {
        self.propagation.cancel(task_id)
    }

    async fn auto_propagate(&self, id: &str) {
        if !self.options.auto_propagate || self.options.default_regions.is_empty() {
            return;
        }
        match self.propagate(id, None, None).await {
            Ok(result) => info!(id = %id, task_id = %result.task_id, status = %result.status, "Auto-propagation started"),
            Err(e) => warn!(id = %id, error = %e, "Auto-propagation failed"),
        }
    }

    /// Full certificate including key material
    pub async fn certificate(&self, id: &str) -> Result<Certificate> {
        let mut certificate = self.store.get(id).await?;
        self.apply_live_state(&mut certificate).await;
        Ok(certificate)
    }

    /// Public view of a stored or pending certificate
    pub async fn get(&self, id: &str) -> Result<CertificateSummary> {
        match self.certificate(id).await {
            Ok(certificate) => Ok(certificate.summary()),
            Err(Error::NotFound(_)) => self
                .pending_summary(id)
                .await
                .ok_or_else(|| Error::NotFound(format!("certificate {}", id))),
            Err(e) => Err(e),
        }
    }

    /// Stored and pending certificates matching `filter`, ordered by id
    pub async fn list(&self, filter: &CertificateFilter) -> Result<Vec<CertificateSummary>> {
        let now = Utc::now();
        // Filter on the live state, not the persisted one
        let mut widened = filter.clone();
        widened.states = None;

        let mut summaries = Vec::new();
        for mut certificate in self.store.list(&widened).await? {
            self.apply_live_state(&mut certificate).await;
            if filter.matches(&certificate, now) {
                summaries.push(certificate.summary());
            }
        }

        if filter.expiring_within.is_none() {
            let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
            for id in ids {
                if let Some(summary) = self.pending_summary(&id).await {
                    let wanted_state = filter
                        .states
                        .as_ref()
                        .map_or(true, |states| states.contains(&summary.state));
                    let wanted_renew = filter.auto_renew.map_or(true, |flag| summary.auto_renew == flag);
                    let wanted_domain = filter.domain.as_ref().map_or(true, |domain| {
                        let domain = domain.to_ascii_lowercase();
                        summary.domains.iter().any(|d| *d == domain)
                    });
                    if wanted_state && wanted_renew && wanted_domain {
                        summaries.push(summary);
                    }
                }
            }
        }

        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries.dedup_by(|a, b| a.id == b.id);
        Ok(summaries)
    }

    /// Active auto-renew certificates inside the renewal window
    pub async fn renewal_candidates(&self) -> Result<Vec<Certificate>> {
        let filter = CertificateFilter::renewal_candidates(self.lifecycle.renewal_threshold());
        let mut candidates = Vec::new();
        for mut certificate in self.store.list(&filter).await? {
            self.apply_live_state(&mut certificate).await;
            if certificate.state == CertificateState::Active {
                candidates.push(certificate);
            }
        }
        Ok(candidates)
    }

    /// Remove a certificate from the store and forget its state.
    ///
    /// Refused while an issuance or renewal is running.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let guard = match self.lifecycle.lock(id).await {
            Ok(guard) => guard,
            Err(Error::NotFound(_)) => return self.store.delete(id).await,
            Err(e) => return Err(e),
        };

        match guard.state() {
            CertificateState::Issuing => {
                return Err(Error::InvalidRequest(format!("Issuance in progress for certificate {}", id)));
            }
            CertificateState::Renewing => return Err(Error::RenewalInProgress(id.to_string())),
            _ => {}
        }

        match self.store.delete(id).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.pending.remove(id);
        self.unpersisted.remove(id);
        drop(guard);
        self.lifecycle.forget(id);
        info!(id = %id, "Certificate deleted");
        Ok(())
    }

    /// Counts for liveness probes; also refreshes the state gauges
    pub async fn health(&self, within: chrono::Duration) -> Result<HealthReport> {
        let now = Utc::now();
        let mut certificates = self.store.list(&CertificateFilter::all()).await?;
        for certificate in certificates.iter_mut() {
            self.apply_live_state(certificate).await;
        }
        let failed = self.lifecycle.count_in_state(CertificateState::Failed).await;
        let report = HealthReport::build(&certificates, failed, within, now);

        for state in [
            CertificateState::Requested,
            CertificateState::Issuing,
            CertificateState::Issued,
            CertificateState::Active,
            CertificateState::Renewing,
            CertificateState::Revoked,
            CertificateState::Expired,
            CertificateState::Failed,
        ] {
            self.metrics
                .set_certificates(state, self.lifecycle.count_in_state(state).await);
        }

        Ok(report)
    }

    /// Last error recorded for a pending issuance
    pub fn last_issuance_error(&self, id: &str) -> Option<String> {
        self.pending.get(id).and_then(|entry| entry.last_error.clone())
    }

    async fn pending_summary(&self, id: &str) -> Option<CertificateSummary> {
        let pending = self.pending.get(id).map(|entry| entry.value().clone())?;
        let record = self.lifecycle.snapshot(id).await?;
        Some(pending.summary(id, record.state, record.retry_count))
    }

    async fn apply_live_state(&self, certificate: &mut Certificate) {
        if let Some(record) = self.lifecycle.snapshot(&certificate.id).await {
            certificate.state = record.state;
            certificate.retry_count = record.retry_count;
        }
        if let Some(deferred) = self.unpersisted.get(&certificate.id) {
            certificate.revocation_reason = deferred.revocation_reason;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::cloud::{CloudProvider, InMemoryCloudStore};
    use crate::propagation::PropagationStatus;
    use crate::store::{CloudDelegatingStore, MemoryStore};

    async fn state_of(harness: &Harness, id: &str) -> CertificateState {
        harness.orchestrator.lifecycle().snapshot(id).await.unwrap().state
    }

    #[tokio::test]
    async fn test_issue_activates_and_persists() {
        let h = harness();
        let cert = h
            .orchestrator
            .issue(request("web", &["example.com", "www.example.com"]))
            .await
            .unwrap();

        assert_eq!(cert.state, CertificateState::Active);
        assert!(cert.expires_at > cert.issued_at);
        assert_eq!(cert.domains, vec!["example.com", "www.example.com"]);
        assert_eq!(cert.challenge_type, ChallengeType::Http01);
        assert!(cert.private_key_pem.contains("PRIVATE KEY"));
        let days = (cert.expires_at - Utc::now()).num_days();
        assert!((89..=90).contains(&days));

        assert_eq!(h.store.get("web").await.unwrap().state, CertificateState::Active);
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);
    }

    #[tokio::test]
    async fn test_issue_generates_id_and_rejects_duplicates() {
        let h = harness();
        let cert = h
            .orchestrator
            .issue(IssueRequest::new(vec!["example.com".into()]))
            .await
            .unwrap();
        assert!(!cert.id.is_empty());

        h.orchestrator.issue(request("web", &["example.org"])).await.unwrap();
        let err = h.orchestrator.issue(request("web", &["example.org"])).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_wildcard_uses_dns01() {
        let h = harness();
        let cert = h
            .orchestrator
            .issue(request("wild", &["*.example.com", "example.com"]))
            .await
            .unwrap();
        assert_eq!(cert.challenge_type, ChallengeType::Dns01);

        let mut bad = request("bad", &["*.example.com"]);
        bad.challenge_type = Some(ChallengeType::Http01);
        assert!(matches!(
            h.orchestrator.issue(bad).await.unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_issuance_reports_domains_and_retries() {
        let h = harness();
        h.acme.fail_domain("www.example.com");

        let err = h
            .orchestrator
            .issue(request("web", &["example.com", "www.example.com"]))
            .await
            .unwrap_err();
        match err {
            Error::ChallengeValidationFailed { challenge_type, domains, .. } => {
                assert_eq!(challenge_type, ChallengeType::Http01);
                assert_eq!(domains, vec!["www.example.com"]);
            }
            other => panic!("unexpected error: {}", other),
        }

        let record = h.orchestrator.lifecycle().snapshot("web").await.unwrap();
        assert_eq!(record.state, CertificateState::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(h.orchestrator.last_issuance_error("web").is_some());

        let summary = h.orchestrator.get("web").await.unwrap();
        assert_eq!(summary.state, CertificateState::Failed);
        assert!(summary.certificate_pem.is_none());

        h.acme.heal();
        let cert = h.orchestrator.retry_issuance("web").await.unwrap();
        assert_eq!(cert.state, CertificateState::Active);
        assert_eq!(cert.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_stops_at_limit() {
        let h = harness_with(Arc::new(MemoryStore::new()), 1, options());
        h.acme.fail_domain("example.com");

        assert!(h.orchestrator.issue(request("web", &["example.com"])).await.is_err());
        let err = h.orchestrator.retry_issuance("web").await.unwrap_err();
        assert!(matches!(err, Error::RetryLimitExceeded { retries: 1, max_retries: 1, .. }));
        assert_eq!(state_of(&h, "web").await, CertificateState::Failed);
        assert!(h.orchestrator.lifecycle().failed_with_retries_remaining().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_failure_counts_as_failed_attempt() {
        let h = harness();
        h.acme.fail_finalize(true);

        let err = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap_err();
        assert!(matches!(err, Error::Acme(_)));
        assert_eq!(state_of(&h, "web").await, CertificateState::Failed);
    }

    #[tokio::test]
    async fn test_timeout_ends_failed() {
        let mut opts = options();
        opts.challenge_timeout = Duration::from_millis(50);
        let h = harness_with(Arc::new(MemoryStore::new()), 3, opts);
        h.acme.stall_domain("example.com");

        let err = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap_err();
        assert!(matches!(err, Error::ChallengeTimeout { .. }));
        assert_eq!(state_of(&h, "web").await, CertificateState::Failed);
    }

    #[tokio::test]
    async fn test_store_outage_leaves_issued_until_resumed() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(true),
        });
        let h = harness_with(store.clone(), 3, options());

        let err = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(state_of(&h, "web").await, CertificateState::Issued);
        let summary = h.orchestrator.get("web").await.unwrap();
        assert!(summary.expires_at.is_some());

        store.failing.store(false, Ordering::SeqCst);
        let finalize_calls = h.acme.finalize_calls();
        let cert = h.orchestrator.resume_activation("web").await.unwrap();
        assert_eq!(cert.state, CertificateState::Active);
        // Activation reuses the material already issued
        assert_eq!(h.acme.finalize_calls(), finalize_calls);
    }

    #[tokio::test]
    async fn test_renew_keeps_id_and_domains() {
        let h = harness();
        let old = issue_expiring_in(&h, "web", &["example.com", "www.example.com"], 10).await;

        let renewed = h.orchestrator.renew("web", false).await.unwrap();
        assert_eq!(renewed.id, "web");
        assert_eq!(renewed.domains, old.domains);
        assert!(renewed.expires_at > old.expires_at);
        assert!(renewed.expires_at > renewed.issued_at);
        assert_ne!(renewed.private_key_pem, old.private_key_pem);
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);
    }

    #[tokio::test]
    async fn test_renew_outside_window_needs_force() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        let err = h.orchestrator.renew("web", false).await.unwrap_err();
        assert!(matches!(err, Error::RenewalNotDue { .. }));
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);

        h.orchestrator.renew("web", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_old_certificate() {
        let h = harness();
        let old = issue_expiring_in(&h, "web", &["example.com"], 10).await;
        h.acme.fail_domain("example.com");

        assert!(h.orchestrator.renew("web", false).await.is_err());
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);
        assert_eq!(h.store.get("web").await.unwrap().certificate_pem, old.certificate_pem);
    }

    #[tokio::test]
    async fn test_concurrent_renewals_only_one_runs() {
        let h = harness();
        issue_expiring_in(&h, "web", &["example.com"], 10).await;
        h.acme.set_polls_until_valid(5);

        let (a, b) = tokio::join!(
            h.orchestrator.renew("web", false),
            h.orchestrator.renew("web", false)
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::RenewalInProgress(_)))));
    }

    #[tokio::test]
    async fn test_revoke_records_reason_and_blocks_renewal() {
        let h = harness();
        let cert = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        let revoked = h
            .orchestrator
            .revoke("web", RevocationReason::KeyCompromise, false)
            .await
            .unwrap();
        assert_eq!(revoked.state, CertificateState::Revoked);
        assert_eq!(revoked.revocation_reason, Some(RevocationReason::KeyCompromise));
        assert_eq!(
            h.acme.revocation_reason(&cert.certificate_pem),
            Some(RevocationReason::KeyCompromise)
        );

        let err = h.orchestrator.renew("web", true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(h.orchestrator.renewal_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_revocation_stays_active() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        h.acme.reject_revocations(true);

        let err = h
            .orchestrator
            .revoke("web", RevocationReason::Superseded, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RevocationFailed { .. }));
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);
    }

    #[tokio::test]
    async fn test_revoke_with_purge_deletes() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        h.orchestrator
            .revoke("web", RevocationReason::CessationOfOperation, true)
            .await
            .unwrap();
        assert!(matches!(h.orchestrator.get("web").await.unwrap_err(), Error::NotFound(_)));
        assert!(!h.orchestrator.lifecycle().contains("web"));
    }

    #[tokio::test]
    async fn test_revocation_kept_through_store_outage() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
        });
        let h = harness_with(store.clone(), 3, options());
        let cert = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let err = h
            .orchestrator
            .revoke("web", RevocationReason::KeyCompromise, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert_eq!(h.acme.revocation_reason(&cert.certificate_pem), Some(RevocationReason::KeyCompromise));

        // The CA acted: the live view is REVOKED even though the store lags
        assert_eq!(state_of(&h, "web").await, CertificateState::Revoked);
        assert_eq!(store.get("web").await.unwrap().state, CertificateState::Active);
        let summary = h.orchestrator.get("web").await.unwrap();
        assert_eq!(summary.state, CertificateState::Revoked);
        assert_eq!(summary.revocation_reason, Some(RevocationReason::KeyCompromise));
        assert!(h.orchestrator.renewal_candidates().await.unwrap().is_empty());
        assert_eq!(h.orchestrator.unpersisted(), vec!["web"]);

        let still_down = h.orchestrator.flush_unpersisted().await;
        assert!(still_down.written.is_empty());
        assert_eq!(still_down.failures.len(), 1);

        store.failing.store(false, Ordering::SeqCst);
        let flushed = h.orchestrator.flush_unpersisted().await;
        assert_eq!(flushed.written, vec!["web"]);
        assert!(h.orchestrator.unpersisted().is_empty());

        let persisted = store.get("web").await.unwrap();
        assert_eq!(persisted.state, CertificateState::Revoked);
        assert_eq!(persisted.revocation_reason, Some(RevocationReason::KeyCompromise));

        // A fresh process over the same store sees REVOKED
        let restarted = harness_with(store, 3, options());
        restarted.orchestrator.restore().await.unwrap();
        assert_eq!(state_of(&restarted, "web").await, CertificateState::Revoked);
    }

    #[tokio::test]
    async fn test_revoke_on_cloud_store_does_not_reimport() {
        let cloud = Arc::new(InMemoryCloudStore::new(CloudProvider::AwsAcm));
        let store: Arc<dyn CertificateStore> = Arc::new(CloudDelegatingStore::new(
            cloud.clone(),
            "us-east-1".into(),
            Arc::new(MemoryStore::new()),
        ));
        let h = harness_with(store.clone(), 3, options());

        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        assert_eq!(cloud.import_count(), 1);

        cloud.fail_region("us-east-1");
        let revoked = h
            .orchestrator
            .revoke("web", RevocationReason::Superseded, false)
            .await
            .unwrap();
        assert_eq!(revoked.state, CertificateState::Revoked);
        assert_eq!(cloud.import_count(), 1);
        assert_eq!(store.get("web").await.unwrap().state, CertificateState::Revoked);

        let restarted = harness_with(store, 3, options());
        restarted.orchestrator.restore().await.unwrap();
        assert_eq!(state_of(&restarted, "web").await, CertificateState::Revoked);
    }

    #[tokio::test]
    async fn test_unpersisted_expiration_is_reported() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
        });
        let h = harness_with(store.clone(), 3, options());
        let cert = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let later = cert.expires_at + chrono::Duration::seconds(1);
        let report = h.orchestrator.expire_due(later).await.unwrap();
        assert!(report.written.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "web");
        assert!(matches!(report.failures[0].1, Error::StoreUnavailable(_)));
        assert_eq!(state_of(&h, "web").await, CertificateState::Expired);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(h.orchestrator.flush_unpersisted().await.written, vec!["web"]);
        assert_eq!(store.get("web").await.unwrap().state, CertificateState::Expired);
    }

    #[tokio::test]
    async fn test_expire_due() {
        let h = harness();
        let cert = h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();

        assert!(h.orchestrator.expire_due(Utc::now()).await.unwrap().written.is_empty());

        let later = cert.expires_at + chrono::Duration::seconds(1);
        let report = h.orchestrator.expire_due(later).await.unwrap();
        assert_eq!(report.written, vec!["web"]);
        assert!(report.failures.is_empty());
        assert_eq!(state_of(&h, "web").await, CertificateState::Expired);
        assert_eq!(h.store.get("web").await.unwrap().state, CertificateState::Expired);
    }

    #[tokio::test]
    async fn test_propagate_uses_default_regions() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        h.aws.fail_region("eu-west-1");

        let result = h.orchestrator.propagate("web", None, None).await.unwrap();
        assert_eq!(result.status, PropagationStatus::Partial);
        assert_eq!(result.failures().len(), 1);

        let status = h.orchestrator.propagation_status(&result.task_id).unwrap();
        assert_eq!(status.status, PropagationStatus::Partial);
    }

    #[tokio::test]
    async fn test_propagate_rejects_revoked() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        h.orchestrator
            .revoke("web", RevocationReason::Unspecified, false)
            .await
            .unwrap();

        let err = h.orchestrator.propagate("web", None, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_auto_propagate_after_issue() {
        let mut opts = options();
        opts.auto_propagate = true;
        let h = harness_with(Arc::new(MemoryStore::new()), 3, opts);

        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        assert_eq!(h.aws.import_count(), 2);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let h = harness();
        h.orchestrator.issue(request("a", &["a.example.com"])).await.unwrap();
        h.orchestrator.issue(request("b", &["b.example.com"])).await.unwrap();
        h.acme.fail_domain("c.example.com");
        let _ = h.orchestrator.issue(request("c", &["c.example.com"])).await;

        let all = h.orchestrator.list(&CertificateFilter::all()).await.unwrap();
        assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);

        let failed = h
            .orchestrator
            .list(&CertificateFilter::in_state(CertificateState::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        h.orchestrator.delete("a").await.unwrap();
        h.orchestrator.delete("c").await.unwrap();
        assert!(matches!(h.orchestrator.delete("a").await.unwrap_err(), Error::NotFound(_)));
        assert_eq!(h.orchestrator.list(&CertificateFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_seeds_state_machine() {
        let store: Arc<dyn CertificateStore> = Arc::new(MemoryStore::new());
        let mut renewing = crate::store::test_support::certificate("web", &["example.com"], 40);
        renewing.state = CertificateState::Renewing;
        store.put(&renewing).await.unwrap();

        let h = harness_with(store, 3, options());
        assert_eq!(h.orchestrator.restore().await.unwrap(), 1);
        assert_eq!(state_of(&h, "web").await, CertificateState::Active);
    }

    #[tokio::test]
    async fn test_restore_skips_tracked_ids() {
        let h = harness();
        h.orchestrator.issue(request("web", &["example.com"])).await.unwrap();
        h.store
            .put(&crate::store::test_support::certificate("api", &["api.example.com"], 60))
            .await
            .unwrap();

        let expires_at = h.store.get("web").await.unwrap().expires_at;
        h.orchestrator
            .lifecycle()
            .restore("web", CertificateState::Renewing, 0, Some(expires_at));

        assert_eq!(h.orchestrator.restore().await.unwrap(), 1);
        assert_eq!(state_of(&h, "api").await, CertificateState::Active);
        assert_eq!(state_of(&h, "web").await, CertificateState::Renewing);
    }

    #[tokio::test]
    async fn test_health_counts() {
        let h = harness();
        h.orchestrator.issue(request("a", &["a.example.com"])).await.unwrap();
        issue_expiring_in(&h, "b", &["b.example.com"], 5).await;
        h.acme.fail_domain("c.example.com");
        let _ = h.orchestrator.issue(request("c", &["c.example.com"])).await;

        let report = h.orchestrator.health(chrono::Duration::days(30)).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.active, 2);
        assert_eq!(report.expiring_soon, 1);
        assert_eq!(report.failed_issuances, 1);
        assert!(report.is_healthy());
    }
}
