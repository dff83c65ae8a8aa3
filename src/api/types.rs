use std::sync::Arc;
use serde::{Serialize, Deserialize};

use crate::lifecycle::CertificateState;
use crate::propagation::{PropagationStrategy, RegionConfig};
use crate::service::CertificateOrchestrator;
use crate::store::CertificateFilter;
use crate::telemetry::MetricsCollector;

/// Default window for `expiring_soon` in the health report
pub const DEFAULT_HEALTH_WINDOW_DAYS: i64 = 30;

/// API state shared between handlers
#[derive(Clone)]
pub struct ApiState {
    /// Certificate orchestrator
    pub orchestrator: Arc<CertificateOrchestrator>,
    /// Metrics collector
    pub metrics: Arc<MetricsCollector>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<CertificateOrchestrator>) -> Self {
        let metrics = orchestrator.metrics().clone();
        Self { orchestrator, metrics }
    }
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Success status
    pub success: bool,
    /// Response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a success response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Query for `GET /certificates`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListQuery {
    pub state: Option<CertificateState>,
    pub domain: Option<String>,
    pub auto_renew: Option<bool>,
    pub expiring_within_days: Option<i64>,
}

impl ListQuery {
    pub fn to_filter(&self) -> CertificateFilter {
        CertificateFilter {
            states: self.state.map(|state| vec![state]),
            auto_renew: self.auto_renew,
            expiring_within: self.expiring_within_days.map(chrono::Duration::days),
            domain: self.domain.clone(),
        }
    }
}

/// Body for `POST /certificates/{id}/renew`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RenewBody {
    #[serde(default)]
    pub force: bool,
}

/// Body for `POST /certificates/{id}/revoke`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RevokeBody {
    /// RFC 5280 reason name; `unspecified` when absent
    #[serde(default)]
    pub reason: Option<String>,
    /// Delete the certificate from the store after revoking
    #[serde(default)]
    pub purge: bool,
}

/// Body for `POST /certificates/{id}/propagate`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PropagateBody {
    #[serde(default)]
    pub strategy: Option<PropagationStrategy>,
    /// Configured regions when absent
    #[serde(default)]
    pub regions: Option<Vec<RegionConfig>>,
}

/// Query for `GET /health`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HealthQuery {
    pub within_days: Option<i64>,
}
