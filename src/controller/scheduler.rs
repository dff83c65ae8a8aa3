use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use serde::{Serialize, Deserialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RenewalConfig;
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::service::CertificateOrchestrator;

/// Finished propagation results older than this are dropped by the sweep
const PROPAGATION_RETENTION_HOURS: i64 = 24;

/// Process-wide scheduler state, shared across sweeps
pub struct RenewalJobState {
    /// Configured sweep interval
    interval: Duration,
    /// Whether the sweep loop is running
    running: AtomicBool,
    /// Start of the last sweep
    last_run: Mutex<Option<DateTime<Utc>>>,
    /// Sweeps in a row that could not reach the store
    consecutive_failures: AtomicU32,
    /// Ids currently being renewed, retried or resumed
    in_flight: DashSet<String>,
}

impl RenewalJobState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: AtomicBool::new(false),
            last_run: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            in_flight: DashSet::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Ids currently claimed
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.in_flight.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Claim an id for the duration of the returned guard
    pub fn claim(self: &Arc<Self>, id: &str) -> Option<RenewalClaim> {
        if self.in_flight.insert(id.to_string()) {
            Some(RenewalClaim {
                state: self.clone(),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    /// Delay before the next sweep.
    ///
    /// The interval after a good sweep; `base * 2^(failures-1)` capped at the
    /// interval after failed ones.
    pub fn next_delay(&self, base: Duration) -> Duration {
        match self.consecutive_failures() {
            0 => self.interval,
            failures => {
                let exponent = (failures - 1).min(31);
                base.saturating_mul(1u32 << exponent).min(self.interval)
            }
        }
    }

    fn begin_sweep(&self, now: DateTime<Utc>) {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    fn finish_sweep(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Claim on one certificate id; released on drop
pub struct RenewalClaim {
    state: Arc<RenewalJobState>,
    id: String,
}

impl RenewalClaim {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RenewalClaim {
    fn drop(&mut self) {
        self.state.in_flight.remove(&self.id);
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    /// Deferred REVOKED or EXPIRED records written this time
    pub persisted: Vec<String>,
    /// ACTIVE certificates moved to EXPIRED
    pub expired: Vec<String>,
    /// FAILED issuances that succeeded on retry
    pub retried: Vec<String>,
    /// ISSUED certificates whose activation finished
    pub resumed: Vec<String>,
    pub renewed: Vec<String>,
    /// Candidates already claimed by another job
    pub skipped: Vec<String>,
    /// id -> error for every operation that failed
    pub failures: Vec<(String, String)>,
    /// Finished propagation results dropped
    pub pruned: usize,
    /// False when the store could not be listed or rejected a write
    pub success: bool,
}

/// Per-certificate work picked up by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepJob {
    /// FAILED issuance with retries left
    Retry,
    /// ISSUED certificate whose activation failed
    Resume,
    Renew,
}

impl SweepJob {
    fn name(&self) -> &'static str {
        match self {
            SweepJob::Retry => "retry",
            SweepJob::Resume => "resume",
            SweepJob::Renew => "renew",
        }
    }
}

/// Periodic renewal sweep
pub struct RenewalScheduler {
    orchestrator: Arc<CertificateOrchestrator>,
    state: Arc<RenewalJobState>,
    /// Retries, resumes and renewals run at once
    workers: usize,
    /// Base delay after a failed sweep
    retry_backoff: Duration,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalScheduler {
    pub fn new(
        orchestrator: Arc<CertificateOrchestrator>,
        state: Arc<RenewalJobState>,
        workers: usize,
        retry_backoff: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            orchestrator,
            state,
            workers: workers.max(1),
            retry_backoff,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(orchestrator: Arc<CertificateOrchestrator>, config: &RenewalConfig) -> Self {
        let state = Arc::new(RenewalJobState::new(Duration::from_secs(config.interval_secs)));
        Self::new(
            orchestrator,
            state,
            config.workers,
            Duration::from_secs(config.retry_backoff_secs),
        )
    }

    pub fn state(&self) -> &Arc<RenewalJobState> {
        &self.state
    }

    /// Start the sweep loop; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let scheduler = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!(interval_secs = scheduler.state.interval().as_secs(), workers = scheduler.workers, "Renewal scheduler started");
            loop {
                let report = scheduler.run_sweep().await;
                let delay = scheduler.state.next_delay(scheduler.retry_backoff);
                if !report.success {
                    warn!(
                        failures = scheduler.state.consecutive_failures(),
                        retry_in_secs = delay.as_secs(),
                        "Renewal sweep failed; backing off"
                    );
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
            scheduler.state.running.store(false, Ordering::SeqCst);
            info!("Renewal scheduler stopped");
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    /// Signal the loop to exit and wait for it
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Renewal scheduler task ended abnormally");
            }
        }
        self.state.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);
    }

    /// Run one sweep now.
    ///
    /// Per-certificate failures are logged and recorded. The sweep fails when
    /// the store cannot be listed or a write is rejected as unavailable.
    pub async fn run_sweep(&self) -> SweepReport {
        let now = Utc::now();
        self.state.begin_sweep(now);

        let mut report = SweepReport {
            started_at: Some(now),
            ..SweepReport::default()
        };

        let success = match self.sweep(now, &mut report).await {
            Ok(writes_landed) => writes_landed,
            Err(e) => {
                error!(error = %e, "Renewal sweep could not read the store");
                report.failures.push(("*".to_string(), e.to_string()));
                false
            }
        };
        report.success = success;

        self.state.finish_sweep(success);
        self.orchestrator.metrics().record_sweep(success);

        info!(
            expired = report.expired.len(),
            retried = report.retried.len(),
            resumed = report.resumed.len(),
            renewed = report.renewed.len(),
            skipped = report.skipped.len(),
            failures = report.failures.len(),
            active_propagations = self.orchestrator.propagation().active_tasks(),
            "Renewal sweep finished"
        );
        report
    }

    /// Returns whether every state write reached the store
    async fn sweep(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<bool, Error> {
        let mut writes_landed = true;

        let deferred = self.orchestrator.flush_unpersisted().await;
        report.persisted = deferred.written;
        writes_landed &= deferred.failures.is_empty();
        for (id, e) in deferred.failures {
            record_failure(report, "persist", id, e);
        }

        let expiry = self.orchestrator.expire_due(now).await?;
        report.expired = expiry.written;
        writes_landed &= expiry.failures.is_empty();
        for (id, e) in expiry.failures {
            record_failure(report, "expire", id, e);
        }

        let lifecycle = self.orchestrator.lifecycle().clone();
        let mut jobs: Vec<(SweepJob, String)> = Vec::new();
        jobs.extend(
            lifecycle
                .failed_with_retries_remaining()
                .await
                .into_iter()
                .map(|id| (SweepJob::Retry, id)),
        );
        jobs.extend(
            lifecycle
                .ids_in_state(CertificateState::Issued)
                .await
                .into_iter()
                .map(|id| (SweepJob::Resume, id)),
        );

        let candidates = self.orchestrator.renewal_candidates().await?;
        debug!(candidates = candidates.len(), jobs = jobs.len(), "Renewal candidates selected");
        jobs.extend(candidates.into_iter().map(|certificate| (SweepJob::Renew, certificate.id)));

        let outcomes: Vec<(SweepJob, String, Option<Result<(), Error>>)> = stream::iter(jobs)
            .map(move |(job, id): (SweepJob, String)| async move {
                let Some(_claim) = self.state.claim(&id) else {
                    return (job, id, None);
                };
                let result = match job {
                    SweepJob::Retry => self.orchestrator.retry_issuance(&id).await.map(|_| ()),
                    SweepJob::Resume => self.orchestrator.resume_activation(&id).await.map(|_| ()),
                    SweepJob::Renew => self.orchestrator.renew(&id, false).await.map(|_| ()),
                };
                (job, id, Some(result))
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (job, id, outcome) in outcomes {
            match (job, outcome) {
                (_, None) | (SweepJob::Renew, Some(Err(Error::RenewalInProgress(_)))) => report.skipped.push(id),
                (SweepJob::Retry, Some(Ok(()))) => report.retried.push(id),
                (SweepJob::Resume, Some(Ok(()))) => report.resumed.push(id),
                (SweepJob::Renew, Some(Ok(()))) => report.renewed.push(id),
                (job, Some(Err(e))) => {
                    writes_landed &= !matches!(e, Error::StoreUnavailable(_));
                    record_failure(report, job.name(), id, e);
                }
            }
        }
        report.retried.sort();
        report.resumed.sort();
        report.renewed.sort();
        report.skipped.sort();

        let cutoff = now - chrono::Duration::hours(PROPAGATION_RETENTION_HOURS);
        report.pruned = self.orchestrator.propagation().prune_finished(cutoff);

        Ok(writes_landed)
    }
}

fn record_failure(report: &mut SweepReport, job: &str, id: String, e: Error) {
    if e.is_retryable() {
        warn!(id = %id, job = job, error = %e, "Sweep job failed; will retry on the next sweep");
    } else {
        error!(id = %id, job = job, error = %e, "Sweep job failed");
    }
    report.failures.push((id, e.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::RevocationReason;
    use crate::service::orchestrator::test_support::*;
    use crate::store::{CertificateStore, MemoryStore};

    fn scheduler(harness: &Harness, workers: usize) -> Arc<RenewalScheduler> {
        let state = Arc::new(RenewalJobState::new(Duration::from_secs(3600)));
        Arc::new(RenewalScheduler::new(
            harness.orchestrator.clone(),
            state,
            workers,
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_sweep_renews_certificate_inside_window() {
        let h = harness();
        let old = issue_expiring_in(&h, "web", &["example.com", "www.example.com"], 10).await;
        let scheduler = scheduler(&h, 2);

        let report = scheduler.run_sweep().await;
        assert!(report.success);
        assert_eq!(report.renewed, vec!["web"]);

        let renewed = h.store.get("web").await.unwrap();
        assert_eq!(renewed.domains, vec!["example.com", "www.example.com"]);
        assert!(renewed.expires_at > old.expires_at);
        let days = (renewed.expires_at - Utc::now()).num_days();
        assert!((89..=90).contains(&days));
        assert!(scheduler.state().last_run().is_some());
        assert!(scheduler.state().in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_ignores_certificates_outside_window() {
        let h = harness();
        issue_expiring_in(&h, "web", &["example.com"], 45).await;

        let report = scheduler(&h, 2).run_sweep().await;
        assert!(report.renewed.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_revoked_certificate_never_selected() {
        let h = harness();
        issue_expiring_in(&h, "web", &["example.com"], 10).await;
        h.orchestrator
            .revoke("web", RevocationReason::KeyCompromise, false)
            .await
            .unwrap();

        let report = scheduler(&h, 2).run_sweep().await;
        assert!(report.renewed.is_empty());
        assert_eq!(
            h.store.get("web").await.unwrap().state,
            CertificateState::Revoked
        );
    }

    #[tokio::test]
    async fn test_failed_issuance_retried_until_limit() {
        let h = harness_with(Arc::new(MemoryStore::new()), 2, options());
        h.acme.fail_domain("example.com");
        assert!(h.orchestrator.issue(request("web", &["example.com"])).await.is_err());

        let scheduler = scheduler(&h, 2);

        // Retry 1 fails again and uses up the budget
        let report = scheduler.run_sweep().await;
        assert!(report.retried.is_empty());
        assert_eq!(report.failures.len(), 1);
        let record = h.orchestrator.lifecycle().snapshot("web").await.unwrap();
        assert_eq!(record.retry_count, 2);

        // At the limit: not touched even once the CA recovers
        h.acme.heal();
        let report = scheduler.run_sweep().await;
        assert!(report.retried.is_empty());
        assert!(report.failures.is_empty());
        let record = h.orchestrator.lifecycle().snapshot("web").await.unwrap();
        assert_eq!(record.state, CertificateState::Failed);
    }

    #[tokio::test]
    async fn test_failed_issuance_recovers_on_sweep() {
        let h = harness();
        h.acme.fail_domain("example.com");
        assert!(h.orchestrator.issue(request("web", &["example.com"])).await.is_err());
        h.acme.heal();

        let report = scheduler(&h, 2).run_sweep().await;
        assert_eq!(report.retried, vec!["web"]);
        assert_eq!(h.store.get("web").await.unwrap().state, CertificateState::Active);
    }

    #[tokio::test]
    async fn test_sweep_expires_lapsed_certificates() {
        let h = harness();
        issue_expiring_in(&h, "old", &["old.example.com"], -1).await;

        let report = scheduler(&h, 2).run_sweep().await;
        assert_eq!(report.expired, vec!["old"]);
        assert!(report.renewed.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_continues_after_failure() {
        let h = harness();
        issue_expiring_in(&h, "a", &["a.example.com"], 5).await;
        issue_expiring_in(&h, "b", &["b.example.com"], 5).await;
        issue_expiring_in(&h, "c", &["c.example.com"], 5).await;
        h.acme.fail_domain("b.example.com");

        let report = scheduler(&h, 1).run_sweep().await;
        assert!(report.success);
        assert_eq!(report.renewed, vec!["a", "c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "b");
        assert_eq!(
            h.orchestrator.lifecycle().snapshot("b").await.unwrap().state,
            CertificateState::Active
        );
    }

    #[tokio::test]
    async fn test_in_flight_ids_are_skipped() {
        let h = harness();
        issue_expiring_in(&h, "web", &["example.com"], 10).await;
        let scheduler = scheduler(&h, 2);

        let claim = scheduler.state().claim("web").unwrap();
        assert!(scheduler.state().claim("web").is_none());

        let report = scheduler.run_sweep().await;
        assert_eq!(report.skipped, vec!["web"]);
        assert!(report.renewed.is_empty());

        drop(claim);
        assert!(scheduler.state().in_flight().is_empty());
        let report = scheduler.run_sweep().await;
        assert_eq!(report.renewed, vec!["web"]);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_renew_once() {
        let h = harness();
        issue_expiring_in(&h, "web", &["example.com"], 10).await;
        h.acme.set_polls_until_valid(4);
        let scheduler = scheduler(&h, 2);

        let finalized = h.acme.finalize_calls();
        let (a, b) = tokio::join!(scheduler.run_sweep(), scheduler.run_sweep());
        assert_eq!(a.renewed.len() + b.renewed.len(), 1);
        assert!(a.failures.is_empty() && b.failures.is_empty());
        assert_eq!(h.acme.finalize_calls(), finalized + 1);
    }

    #[tokio::test]
    async fn test_one_pool_runs_retries_resumes_and_renewals() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with(store.clone(), 3, options());
        issue_expiring_in(&h, "due", &["due.example.com"], 5).await;

        h.acme.fail_domain("failed.example.com");
        assert!(h.orchestrator.issue(request("failed", &["failed.example.com"])).await.is_err());
        h.acme.heal();

        store.set_failing(true);
        assert!(h.orchestrator.issue(request("issued", &["issued.example.com"])).await.is_err());
        store.set_failing(false);

        let report = scheduler(&h, 1).run_sweep().await;
        assert!(report.success);
        assert_eq!(report.retried, vec!["failed"]);
        assert_eq!(report.resumed, vec!["issued"]);
        assert_eq!(report.renewed, vec!["due"]);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_unpersisted_expiration_fails_sweep_until_written() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with(store.clone(), 3, options());
        issue_expiring_in(&h, "old", &["old.example.com"], -1).await;
        let scheduler = scheduler(&h, 2);

        store.set_failing(true);
        let report = scheduler.run_sweep().await;
        assert!(!report.success);
        assert!(report.expired.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "old");
        assert_eq!(scheduler.state().consecutive_failures(), 1);
        assert_eq!(store.get("old").await.unwrap().state, CertificateState::Active);

        store.set_failing(false);
        let report = scheduler.run_sweep().await;
        assert!(report.success);
        assert_eq!(report.persisted, vec!["old"]);
        assert_eq!(scheduler.state().consecutive_failures(), 0);
        assert_eq!(store.get("old").await.unwrap().state, CertificateState::Expired);
    }

    #[tokio::test]
    async fn test_unpersisted_revocation_written_by_sweep() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with(store.clone(), 3, options());
        issue_expiring_in(&h, "web", &["example.com"], 10).await;

        store.set_failing(true);
        assert!(h
            .orchestrator
            .revoke("web", RevocationReason::KeyCompromise, false)
            .await
            .is_err());
        store.set_failing(false);

        let report = scheduler(&h, 2).run_sweep().await;
        assert!(report.success);
        assert_eq!(report.persisted, vec!["web"]);
        assert!(report.renewed.is_empty());
        assert_eq!(store.get("web").await.unwrap().state, CertificateState::Revoked);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let state = RenewalJobState::new(Duration::from_secs(600));
        let base = Duration::from_secs(60);
        assert_eq!(state.next_delay(base), Duration::from_secs(600));

        state.finish_sweep(false);
        assert_eq!(state.next_delay(base), Duration::from_secs(60));
        state.finish_sweep(false);
        assert_eq!(state.next_delay(base), Duration::from_secs(120));
        state.finish_sweep(false);
        assert_eq!(state.next_delay(base), Duration::from_secs(240));
        state.finish_sweep(false);
        state.finish_sweep(false);
        assert_eq!(state.next_delay(base), Duration::from_secs(600));

        state.finish_sweep(true);
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.next_delay(base), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_ends_loop() {
        let h = harness();
        let scheduler = scheduler(&h, 2);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.state().is_running());

        for _ in 0..100 {
            if scheduler.state().last_run().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.state().last_run().is_some());

        scheduler.stop().await;
        assert!(!scheduler.state().is_running());

        assert!(scheduler.start());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_started_loop_renews_due_certificate() {
        let h = harness();
        let old = issue_expiring_in(&h, "web", &["example.com"], 10).await;
        let scheduler = scheduler(&h, 2);

        assert!(scheduler.start());
        let mut renewed = None;
        for _ in 0..200 {
            let current = h.store.get("web").await.unwrap();
            if current.expires_at > old.expires_at {
                renewed = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;

        let renewed = renewed.expect("background sweep renewed the certificate");
        assert_eq!(renewed.state, CertificateState::Active);
        assert_ne!(renewed.certificate_pem, old.certificate_pem);
        assert_eq!(scheduler.state().consecutive_failures(), 0);
        assert!(!scheduler.state().is_running());
    }
}
