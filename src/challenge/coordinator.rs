use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::stream::{self, StreamExt};
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::acme::{AcmeClient, ChallengeRequest, ChallengeStatus, ChallengeType};
use crate::challenge::dns::{dns01_record_name, dns01_txt_value, dns01_zone, DnsProvider};
use crate::challenge::http01::Http01Responder;
use crate::domain::has_wildcard;
use crate::error::Error;
use crate::types::Result;

/// Default number of domains validated at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Outcome for one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOutcome {
    pub domain: String,
    pub status: ChallengeStatus,
    /// Failure detail for invalid or expired domains
    pub detail: Option<String>,
}

/// Per-domain results of one validation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub challenge_type: ChallengeType,
    /// In the order the domains were given
    pub outcomes: Vec<DomainOutcome>,
    pub timeout_secs: u64,
}

impl ValidationResult {
    /// Whether every domain validated
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == ChallengeStatus::Valid)
    }

    /// Domains that did not validate
    pub fn failed_domains(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status != ChallengeStatus::Valid)
            .map(|o| o.domain.clone())
            .collect()
    }

    /// Convert a failed run into the matching error.
    ///
    /// `ChallengeTimeout` when every failing domain ran out of time,
    /// `ChallengeValidationFailed` otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }

        let failed: Vec<&DomainOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.status != ChallengeStatus::Valid)
            .collect();
        let domains: Vec<String> = failed.iter().map(|o| o.domain.clone()).collect();

        if failed.iter().all(|o| o.status == ChallengeStatus::Expired) {
            return Err(Error::ChallengeTimeout {
                challenge_type: self.challenge_type,
                domains,
                timeout_secs: self.timeout_secs,
            });
        }

        let detail = failed
            .iter()
            .map(|o| format!("{}: {}", o.domain, o.detail.as_deref().unwrap_or("invalid")))
            .collect::<Vec<_>>()
            .join("; ");

        Err(Error::ChallengeValidationFailed {
            challenge_type: self.challenge_type,
            domains,
            detail,
        })
    }
}

/// Drives ACME challenges for a set of domains.
///
/// Domains run concurrently up to `max_concurrency`; one failing domain does
/// not cancel its siblings. Every published token or TXT record is removed
/// once its domain finishes, including on timeout.
pub struct ChallengeCoordinator {
    acme: Arc<dyn AcmeClient>,
    dns: Arc<dyn DnsProvider>,
    http: Http01Responder,
    max_concurrency: usize,
    poll_interval: Duration,
    dns_propagation_delay: Duration,
    dns_zone: Option<String>,
}

impl ChallengeCoordinator {
    pub fn new(acme: Arc<dyn AcmeClient>, dns: Arc<dyn DnsProvider>, http: Http01Responder) -> Self {
        Self {
            acme,
            dns,
            http,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval: Duration::from_secs(2),
            dns_propagation_delay: Duration::from_secs(30),
            dns_zone: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_dns_propagation_delay(mut self, delay: Duration) -> Self {
        self.dns_propagation_delay = delay;
        self
    }

    pub fn with_dns_zone(mut self, zone: Option<String>) -> Self {
        self.dns_zone = zone;
        self
    }

    /// Responder the HTTP-01 listener must serve
    pub fn http_responder(&self) -> &Http01Responder {
        &self.http
    }

    /// Validate all domains; the timeout applies to each domain
    pub async fn validate(
        &self,
        domains: &[String],
        challenge_type: ChallengeType,
        timeout: Duration,
    ) -> Result<ValidationResult> {
        if domains.is_empty() {
            return Err(Error::InvalidRequest("No domains to validate".into()));
        }
        if challenge_type == ChallengeType::Http01 && has_wildcard(domains) {
            return Err(Error::InvalidRequest(
                "Wildcard domains require the dns-01 challenge".into(),
            ));
        }

        info!(domains = ?domains, challenge_type = %challenge_type, "Validating domains");

        let mut indexed: Vec<(usize, DomainOutcome)> = stream::iter(domains.to_vec().into_iter().enumerate())
            .map(move |(index, domain): (usize, String)| async move {
                (index, self.validate_domain(&domain, challenge_type, timeout).await)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let result = ValidationResult {
            challenge_type,
            outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
            timeout_secs: timeout.as_secs(),
        };

        if result.is_success() {
            info!(challenge_type = %challenge_type, "All domains validated");
        } else {
            warn!(failed = ?result.failed_domains(), challenge_type = %challenge_type, "Domain validation failed");
        }

        Ok(result)
    }

    async fn validate_domain(&self, domain: &str, challenge_type: ChallengeType, timeout: Duration) -> DomainOutcome {
        // Filled as soon as something is published so cleanup also runs after a timeout
        let published: Mutex<Option<ChallengeRequest>> = Mutex::new(None);

        let outcome = match tokio::time::timeout(timeout, self.run_challenge(domain, challenge_type, &published)).await {
            Ok(Ok(status)) => DomainOutcome {
                domain: domain.to_string(),
                detail: (status != ChallengeStatus::Valid).then(|| "rejected by CA".to_string()),
                status,
            },
            Ok(Err(e)) => DomainOutcome {
                domain: domain.to_string(),
                status: ChallengeStatus::Invalid,
                detail: Some(e.to_string()),
            },
            Err(_) => DomainOutcome {
                domain: domain.to_string(),
                status: ChallengeStatus::Expired,
                detail: Some(format!("no result within {}s", timeout.as_secs())),
            },
        };

        let request = published.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut request) = request {
            request.status = outcome.status;
            self.cleanup(&request).await;
        }

        debug!(domain = %domain, status = %outcome.status, "Domain challenge finished");
        outcome
    }

    async fn run_challenge(
        &self,
        domain: &str,
        challenge_type: ChallengeType,
        published: &Mutex<Option<ChallengeRequest>>,
    ) -> Result<ChallengeStatus> {
        let grant = self.acme.request_challenge(domain, challenge_type).await?;

        let validation_value = match challenge_type {
            ChallengeType::Http01 => grant.key_authorization.clone(),
            ChallengeType::Dns01 => dns01_txt_value(&grant.key_authorization),
        };
        let request = ChallengeRequest {
            domain: domain.to_string(),
            challenge_type,
            token: grant.token.clone(),
            validation_value,
            status: ChallengeStatus::Pending,
        };

        if let Ok(mut slot) = published.lock() {
            *slot = Some(request.clone());
        }

        match challenge_type {
            ChallengeType::Http01 => {
                self.http.publish(&request.token, &request.validation_value);
            }
            ChallengeType::Dns01 => {
                let zone = dns01_zone(domain, self.dns_zone.as_deref());
                let name = dns01_record_name(domain);
                self.dns
                    .create_txt_record(&zone, &name, &request.validation_value)
                    .await?;
                debug!(domain = %domain, record = %name, "Waiting for DNS propagation");
                tokio::time::sleep(self.dns_propagation_delay).await;
            }
        }

        loop {
            let status = self.acme.validate(domain, &request.token).await?;
            if status.is_final() {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cleanup(&self, request: &ChallengeRequest) {
        match request.challenge_type {
            ChallengeType::Http01 => {
                self.http.withdraw(&request.token);
            }
            ChallengeType::Dns01 => {
                let zone = dns01_zone(&request.domain, self.dns_zone.as_deref());
                let name = dns01_record_name(&request.domain);
                if let Err(e) = self
                    .dns
                    .delete_txt_record(&zone, &name, &request.validation_value)
                    .await
                {
                    warn!(domain = %request.domain, record = %name, error = %e, "Failed to remove DNS-01 record");
                }
            }
        }
    }
}
