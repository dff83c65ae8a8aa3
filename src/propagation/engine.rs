use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::cloud::{CertificateBundle, CloudAdapterRegistry};
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::propagation::types::{
    PropagationResult, PropagationStatus, PropagationStrategy, RegionConfig, RegionResult,
};
use crate::store::CertificateStore;
use crate::telemetry::MetricsCollector;
use crate::types::Result;

/// Detail recorded for regions still pending when a task is cancelled
pub const CANCELLED_DETAIL: &str = "cancelled";

/// Tracked propagation
struct PropagationTask {
    sender: Arc<watch::Sender<PropagationResult>>,
    abort: Option<AbortHandle>,
}

/// Replicates certificates to regional cloud stores.
///
/// Every call fans out to its regions concurrently (bounded by
/// `max_concurrency`), each with its own timeout. A failing region never
/// cancels the others. Results stay queryable by task id until pruned.
pub struct PropagationEngine {
    store: Arc<dyn CertificateStore>,
    registry: CloudAdapterRegistry,
    max_concurrency: usize,
    region_timeout: Duration,
    tasks: DashMap<String, PropagationTask>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl PropagationEngine {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        registry: CloudAdapterRegistry,
        max_concurrency: usize,
        region_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            max_concurrency: max_concurrency.max(1),
            region_timeout,
            tasks: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Propagate a certificate to `regions`.
    ///
    /// `Sync` returns the final result. `Async` returns at once with every
    /// region pending; use [`status`](Self::status) or [`wait`](Self::wait)
    /// with the returned task id.
    pub async fn propagate(
        &self,
        certificate_id: &str,
        strategy: PropagationStrategy,
        regions: &[RegionConfig],
    ) -> Result<PropagationResult> {
        if regions.is_empty() {
            return Err(Error::InvalidRequest("Propagation needs at least one region".into()));
        }
        let mut names = HashSet::new();
        if let Some(dup) = regions.iter().find(|r| !names.insert(r.name.as_str())) {
            return Err(Error::InvalidRequest(format!("Duplicate region: {}", dup.name)));
        }

        let certificate = self.store.get(certificate_id).await?;
        if !matches!(certificate.state, CertificateState::Active | CertificateState::Renewing) {
            return Err(Error::InvalidRequest(format!(
                "Certificate {} is {} and cannot be propagated",
                certificate_id, certificate.state
            )));
        }

        let bundle = CertificateBundle {
            certificate_pem: certificate.certificate_pem,
            chain_pem: certificate.chain_pem,
            private_key_pem: certificate.private_key_pem,
        };

        let task_id = uuid::Uuid::new_v4().to_string();
        let initial = PropagationResult::new(task_id.clone(), certificate_id, strategy, regions);
        let (sender, _) = watch::channel(initial.clone());
        let sender = Arc::new(sender);

        let fan_out = FanOut {
            registry: self.registry.clone(),
            certificate_id: certificate_id.to_string(),
            bundle,
            regions: regions.to_vec(),
            max_concurrency: self.max_concurrency,
            region_timeout: self.region_timeout,
            sender: sender.clone(),
            metrics: self.metrics.clone(),
        };

        info!(id = %certificate_id, task_id = %task_id, strategy = %strategy, regions = regions.len(), "Starting propagation");

        match strategy {
            PropagationStrategy::Sync => {
                self.tasks.insert(task_id.clone(), PropagationTask { sender: sender.clone(), abort: None });
                fan_out.run().await;
                let result = sender.borrow().clone();
                Ok(result)
            }
            PropagationStrategy::Async => {
                let handle = tokio::spawn(fan_out.run());
                self.tasks.insert(
                    task_id,
                    PropagationTask {
                        sender,
                        abort: Some(handle.abort_handle()),
                    },
                );
                Ok(initial)
            }
        }
    }

    /// Current state of a propagation
    pub fn status(&self, task_id: &str) -> Result<PropagationResult> {
        self.tasks
            .get(task_id)
            .map(|task| task.sender.borrow().clone())
            .ok_or_else(|| Error::NotFound(format!("Propagation task {}", task_id)))
    }

    /// Wait until a propagation reaches a final status
    pub async fn wait(&self, task_id: &str) -> Result<PropagationResult> {
        let mut receiver = self
            .tasks
            .get(task_id)
            .map(|task| task.sender.subscribe())
            .ok_or_else(|| Error::NotFound(format!("Propagation task {}", task_id)))?;

        loop {
            {
                let current = receiver.borrow_and_update();
                if current.status.is_final() {
                    return Ok(current.clone());
                }
            }
            if receiver.changed().await.is_err() {
                return Ok(receiver.borrow().clone());
            }
        }
    }

    /// Abort a propagation; regions still pending are marked failed
    pub fn cancel(&self, task_id: &str) -> Result<PropagationResult> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::NotFound(format!("Propagation task {}", task_id)))?;

        if task.sender.borrow().status.is_final() {
            return Ok(task.sender.borrow().clone());
        }

        if let Some(abort) = &task.abort {
            abort.abort();
        }
        task.sender.send_modify(|result| result.fail_pending(CANCELLED_DETAIL));
        warn!(task_id = %task_id, "Propagation cancelled");

        let result = task.sender.borrow().clone();
        Ok(result)
    }

    /// Drop finished tasks that completed before `before`
    pub fn prune_finished(&self, before: DateTime<Utc>) -> usize {
        let initial = self.tasks.len();
        self.tasks.retain(|_, task| {
            let result = task.sender.borrow();
            !(result.status.is_final() && result.finished_at.map_or(false, |t| t < before))
        });
        initial - self.tasks.len()
    }

    /// Tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !task.sender.borrow().status.is_final())
            .count()
    }
}

/// Owned state of one fan-out, movable into a spawned task
struct FanOut {
    registry: CloudAdapterRegistry,
    certificate_id: String,
    bundle: CertificateBundle,
    regions: Vec<RegionConfig>,
    max_concurrency: usize,
    region_timeout: Duration,
    sender: Arc<watch::Sender<PropagationResult>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl FanOut {
    async fn run(self) {
        let this = &self;
        stream::iter(this.regions.clone().into_iter())
            .map(move |region: RegionConfig| async move {
                let result = this.import_region(&region).await;
                (region, result)
            })
            .buffer_unordered(this.max_concurrency)
            .for_each(move |(region, result)| async move {
                if let Some(metrics) = &this.metrics {
                    metrics.record_propagation(&region.name, result.outcome);
                }
                this.sender.send_modify(|p| p.record(&region.name, result));
            })
            .await;

        let result = self.sender.borrow().clone();
        match result.status {
            PropagationStatus::Success => {
                info!(id = %result.certificate_id, task_id = %result.task_id, "Propagation succeeded")
            }
            status => {
                warn!(
                    id = %result.certificate_id,
                    task_id = %result.task_id,
                    status = %status,
                    failures = ?result.failures(),
                    "Propagation finished with failures"
                )
            }
        }
    }

    async fn import_region(&self, region: &RegionConfig) -> RegionResult {
        let adapter = match self.registry.get(region.provider) {
            Some(adapter) => adapter,
            None => {
                return RegionResult::failure(format!(
                    "no adapter registered for provider {}",
                    region.provider
                ))
            }
        };

        let import = adapter.import_certificate(&region.region, &self.certificate_id, &self.bundle);
        match tokio::time::timeout(self.region_timeout, import).await {
            Ok(Ok(handle)) => {
                debug!(id = %self.certificate_id, region = %region.name, "Region import succeeded");
                RegionResult::success(handle)
            }
            Ok(Err(e)) => {
                warn!(id = %self.certificate_id, region = %region.name, error = %e, "Region import failed");
                RegionResult::failure(e.to_string())
            }
            Err(_) => {
                warn!(id = %self.certificate_id, region = %region.name, "Region import timed out");
                RegionResult::failure(format!("timed out after {}s", self.region_timeout.as_secs_f64()))
            }
        }
    }
}
