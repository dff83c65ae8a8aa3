use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Deserialize};

use crate::domain::Certificate;
use crate::lifecycle::CertificateState;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// No certificate has lapsed
    #[serde(rename = "healthy")]
    Healthy,
    /// At least one certificate expired
    #[serde(rename = "degraded")]
    Degraded,
}

/// Certificate counts for liveness probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Stored certificates
    pub total: usize,
    pub active: usize,
    /// Active certificates expiring inside the window
    pub expiring_soon: usize,
    /// Certificates past expiration, whether or not the sweep marked them yet
    pub expired: usize,
    pub revoked: usize,
    /// Issuances sitting in FAILED
    pub failed_issuances: usize,
    /// Window used for `expiring_soon`
    pub within_days: i64,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Summarize stored certificates at `now`
    pub fn build(
        certificates: &[Certificate],
        failed_issuances: usize,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut active = 0;
        let mut expiring_soon = 0;
        let mut expired = 0;
        let mut revoked = 0;

        for certificate in certificates {
            match certificate.state {
                CertificateState::Revoked => revoked += 1,
                CertificateState::Expired => expired += 1,
                _ if certificate.is_expired_at(now) => expired += 1,
                CertificateState::Active | CertificateState::Renewing => {
                    active += 1;
                    if certificate.remaining(now) <= within {
                        expiring_soon += 1;
                    }
                }
                _ => {}
            }
        }

        let status = if expired > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            total: certificates.len(),
            active,
            expiring_soon,
            expired,
            revoked,
            failed_issuances,
            within_days: within.num_days(),
            status,
            checked_at: now,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
