use std::sync::Arc;
use async_trait::async_trait;

use crate::acme::types::{ChallengeGrant, ChallengeStatus, ChallengeType, IssuedCertificate, RevocationReason};
use crate::config::Settings;
use crate::error::Error;
use crate::types::Result;

/// ACME client capability.
///
/// The wire protocol lives behind this trait; the orchestrator only needs
/// challenge issuance, validation polling, finalization and revocation.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Obtain a challenge of the given type for a domain
    async fn request_challenge(&self, domain: &str, challenge_type: ChallengeType) -> Result<ChallengeGrant>;

    /// Signal readiness (first call) and report the current validation status
    async fn validate(&self, domain: &str, token: &str) -> Result<ChallengeStatus>;

    /// Submit a CSR for validated domains and return the issued chain
    async fn finalize(&self, csr_pem: &str, domains: &[String]) -> Result<IssuedCertificate>;

    /// Revoke a certificate
    async fn revoke(&self, certificate_pem: &str, reason: RevocationReason) -> Result<()>;
}

/// Create an ACME client based on configuration
pub fn create_acme_client(config: &Settings) -> Result<Arc<dyn AcmeClient>> {
    match config.acme.provider.as_str() {
        "mock" => {
            let client = crate::acme::mock::MockAcmeClient::new(config.acme.validity_days);
            Ok(Arc::new(client))
        },
        other => Err(Error::Config(format!(
            "Unsupported ACME provider '{}': supply an AcmeClient implementation",
            other
        ))),
    }
}
