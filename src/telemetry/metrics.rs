use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::acme::{ChallengeStatus, ChallengeType};
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::propagation::RegionOutcome;
use crate::types::Result;

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Metrics collector
pub struct MetricsCollector {
    /// Whether recording is enabled
    enabled: bool,
    /// Registry
    registry: Registry,
    /// Issuance attempts by result
    issuances: IntCounterVec,
    /// Renewal attempts by result
    renewals: IntCounterVec,
    /// Revocations by result
    revocations: IntCounterVec,
    /// Domain challenges by type and status
    challenges: IntCounterVec,
    /// Region imports by region and outcome
    propagations: IntCounterVec,
    /// Scheduler sweeps by result
    sweeps: IntCounterVec,
    /// Certificates per lifecycle state
    certificates: IntGaugeVec,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new(enabled: bool) -> Result<Self> {
        let registry = Registry::new();

        let issuances = IntCounterVec::new(
            Opts::new("certpilot_issuances_total", "Certificate issuance attempts"),
            &["result"],
        )?;
        let renewals = IntCounterVec::new(
            Opts::new("certpilot_renewals_total", "Certificate renewal attempts"),
            &["result"],
        )?;
        let revocations = IntCounterVec::new(
            Opts::new("certpilot_revocations_total", "Certificate revocations"),
            &["result"],
        )?;
        let challenges = IntCounterVec::new(
            Opts::new("certpilot_challenges_total", "Domain challenge outcomes"),
            &["challenge_type", "status"],
        )?;
        let propagations = IntCounterVec::new(
            Opts::new("certpilot_propagations_total", "Regional propagation outcomes"),
            &["region", "result"],
        )?;
        let sweeps = IntCounterVec::new(
            Opts::new("certpilot_renewal_sweeps_total", "Renewal scheduler sweeps"),
            &["result"],
        )?;
        let certificates = IntGaugeVec::new(
            Opts::new("certpilot_certificates", "Managed certificates by lifecycle state"),
            &["state"],
        )?;

        registry.register(Box::new(issuances.clone()))?;
        registry.register(Box::new(renewals.clone()))?;
        registry.register(Box::new(revocations.clone()))?;
        registry.register(Box::new(challenges.clone()))?;
        registry.register(Box::new(propagations.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;
        registry.register(Box::new(certificates.clone()))?;

        Ok(Self {
            enabled,
            registry,
            issuances,
            renewals,
            revocations,
            challenges,
            propagations,
            sweeps,
            certificates,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_issuance(&self, success: bool) {
        if self.enabled {
            self.issuances.with_label_values(&[result_label(success)]).inc();
        }
    }

    pub fn record_renewal(&self, success: bool) {
        if self.enabled {
            self.renewals.with_label_values(&[result_label(success)]).inc();
        }
    }

    pub fn record_revocation(&self, success: bool) {
        if self.enabled {
            self.revocations.with_label_values(&[result_label(success)]).inc();
        }
    }

    pub fn record_challenge(&self, challenge_type: ChallengeType, status: ChallengeStatus) {
        if self.enabled {
            self.challenges
                .with_label_values(&[&challenge_type.to_string(), &status.to_string()])
                .inc();
        }
    }

    pub fn record_propagation(&self, region: &str, outcome: RegionOutcome) {
        if self.enabled {
            let result = match outcome {
                RegionOutcome::Success => "success",
                RegionOutcome::Failure => "failure",
                RegionOutcome::Pending => "pending",
            };
            self.propagations.with_label_values(&[region, result]).inc();
        }
    }

    pub fn record_sweep(&self, success: bool) {
        if self.enabled {
            self.sweeps.with_label_values(&[result_label(success)]).inc();
        }
    }

    /// Publish the number of certificates in a state
    pub fn set_certificates(&self, state: CertificateState, count: usize) {
        if self.enabled {
            self.certificates
                .with_label_values(&[&state.to_string()])
                .set(count as i64);
        }
    }

    /// Render all metrics in the prometheus text format
    pub fn gather_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        let metrics = MetricsCollector::new(true).unwrap();
        metrics.record_issuance(true);
        metrics.record_challenge(ChallengeType::Dns01, ChallengeStatus::Valid);
        metrics.record_propagation("use1", RegionOutcome::Failure);
        metrics.set_certificates(CertificateState::Active, 3);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("certpilot_issuances_total{result=\"success\"} 1"));
        assert!(text.contains("challenge_type=\"dns-01\""));
        assert!(text.contains("region=\"use1\""));
        assert!(text.contains("certpilot_certificates{state=\"ACTIVE\"} 3"));
    }

    #[test]
    fn test_disabled_collector_records_nothing() {
        let metrics = MetricsCollector::new(false).unwrap();
        metrics.record_issuance(true);
        assert!(!metrics.gather_text().unwrap().contains("certpilot_issuances_total{"));
    }
}
