use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::cloud::CloudProvider;
use crate::error::Error;
use crate::types::Result;

/// How a propagation call waits for its regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationStrategy {
    /// Wait for every region, then return the aggregate
    Sync,
    /// Return a task id at once and track regions in the background
    Async,
}

impl Default for PropagationStrategy {
    fn default() -> Self {
        PropagationStrategy::Sync
    }
}

impl fmt::Display for PropagationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropagationStrategy::Sync => write!(f, "sync"),
            PropagationStrategy::Async => write!(f, "async"),
        }
    }
}

impl FromStr for PropagationStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(PropagationStrategy::Sync),
            "async" => Ok(PropagationStrategy::Async),
            other => Err(Error::InvalidRequest(format!("Unknown propagation strategy: {}", other))),
        }
    }
}

/// One propagation target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Unique region name used as the result key
    pub name: String,
    pub provider: CloudProvider,
    /// Provider-side region identifier
    pub region: String,
}

/// State of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionOutcome {
    Pending,
    Success,
    Failure,
}

/// Per-region record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionResult {
    pub outcome: RegionOutcome,
    /// Failure detail
    pub error: Option<String>,
    /// Handle returned by the cloud store
    pub handle: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RegionResult {
    pub fn pending() -> Self {
        Self {
            outcome: RegionOutcome::Pending,
            error: None,
            handle: None,
            completed_at: None,
        }
    }

    pub fn success(handle: String) -> Self {
        Self {
            outcome: RegionOutcome::Success,
            error: None,
            handle: Some(handle),
            completed_at: Some(Utc::now()),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            outcome: RegionOutcome::Failure,
            error: Some(detail.into()),
            handle: None,
            completed_at: Some(Utc::now()),
        }
    }
}

/// Aggregate state of a propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationStatus {
    /// At least one region has not reported
    Pending,
    Success,
    Partial,
    Failed,
}

impl PropagationStatus {
    /// Derive the overall status from region outcomes
    pub fn aggregate<'a>(outcomes: impl IntoIterator<Item = &'a RegionOutcome>) -> Self {
        let (mut successes, mut failures, mut pending) = (0usize, 0usize, 0usize);
        for outcome in outcomes {
            match outcome {
                RegionOutcome::Success => successes += 1,
                RegionOutcome::Failure => failures += 1,
                RegionOutcome::Pending => pending += 1,
            }
        }

        if pending > 0 {
            PropagationStatus::Pending
        } else if failures == 0 {
            PropagationStatus::Success
        } else if successes == 0 {
            PropagationStatus::Failed
        } else {
            PropagationStatus::Partial
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, PropagationStatus::Pending)
    }
}

impl fmt::Display for PropagationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropagationStatus::Pending => "pending",
            PropagationStatus::Success => "success",
            PropagationStatus::Partial => "partial",
            PropagationStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Record of one propagation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationResult {
    pub task_id: String,
    pub certificate_id: String,
    pub strategy: PropagationStrategy,
    /// Region name -> outcome
    pub regions: BTreeMap<String, RegionResult>,
    pub status: PropagationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PropagationResult {
    pub fn new(task_id: String, certificate_id: &str, strategy: PropagationStrategy, regions: &[RegionConfig]) -> Self {
        Self {
            task_id,
            certificate_id: certificate_id.to_string(),
            strategy,
            regions: regions
                .iter()
                .map(|r| (r.name.clone(), RegionResult::pending()))
                .collect(),
            status: PropagationStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record a region's result and refresh the overall status
    pub fn record(&mut self, region: &str, result: RegionResult) {
        self.regions.insert(region.to_string(), result);
        self.refresh();
    }

    /// Fail every region still pending with `detail`
    pub fn fail_pending(&mut self, detail: &str) {
        for result in self.regions.values_mut() {
            if result.outcome == RegionOutcome::Pending {
                *result = RegionResult::failure(detail);
            }
        }
        self.refresh();
    }

    fn refresh(&mut self) {
        self.status = PropagationStatus::aggregate(self.regions.values().map(|r| &r.outcome));
        if self.status.is_final() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Region names that failed, with their detail
    pub fn failures(&self) -> Vec<(String, String)> {
        self.regions
            .iter()
            .filter(|(_, r)| r.outcome == RegionOutcome::Failure)
            .map(|(name, r)| (name.clone(), r.error.clone().unwrap_or_default()))
            .collect()
    }
}
