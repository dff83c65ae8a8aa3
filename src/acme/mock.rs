use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::acme::provider::AcmeClient;
use crate::acme::types::{ChallengeGrant, ChallengeStatus, ChallengeType, IssuedCertificate, RevocationReason};
use crate::error::Error;
use crate::types::Result;

/// Mock certificate information
#[derive(Debug, Clone)]
struct MockCertInfo {
    /// Domains on the certificate
    domains: Vec<String>,
    /// Whether the certificate is revoked
    revoked: bool,
    /// Revocation reason
    revocation_reason: Option<RevocationReason>,
}

/// Scripted in-process CA.
///
/// Behaves like an ACME server that validates every challenge after a
/// configurable number of polls. Individual domains can be scripted to fail
/// or to never finish, and revocations can be rejected.
pub struct MockAcmeClient {
    /// Certificate validity in days
    validity_days: i64,
    /// Polls before a challenge turns valid
    polls_until_valid: AtomicU32,
    /// Domains whose challenges turn invalid
    failing_domains: DashSet<String>,
    /// Domains whose challenges never leave pending
    stalled_domains: DashSet<String>,
    /// domain -> outstanding token
    tokens: DashMap<String, String>,
    /// domain -> polls seen for the outstanding token
    polls: DashMap<String, u32>,
    /// Domains with a valid authorization
    validated: DashSet<String>,
    /// Reject every revocation
    reject_revocations: AtomicBool,
    /// Fail every finalization
    fail_finalize: AtomicBool,
    /// Counters
    challenge_requests: AtomicUsize,
    finalize_calls: AtomicUsize,
    /// Issued certificates keyed by PEM
    issued: Mutex<HashMap<String, MockCertInfo>>,
    /// Account key thumbprint
    thumbprint: String,
}

impl MockAcmeClient {
    /// Create a new mock ACME client
    pub fn new(validity_days: i64) -> Self {
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(b"certpilot-mock-account"));

        Self {
            validity_days,
            polls_until_valid: AtomicU32::new(1),
            failing_domains: DashSet::new(),
            stalled_domains: DashSet::new(),
            tokens: DashMap::new(),
            polls: DashMap::new(),
            validated: DashSet::new(),
            reject_revocations: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
            challenge_requests: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            issued: Mutex::new(HashMap::new()),
            thumbprint,
        }
    }

    /// Number of polls before a challenge becomes valid
    pub fn set_polls_until_valid(&self, polls: u32) {
        self.polls_until_valid.store(polls.max(1), Ordering::SeqCst);
    }

    /// Make a domain's challenges fail
    pub fn fail_domain(&self, domain: &str) {
        self.failing_domains.insert(domain.to_string());
    }

    /// Make a domain's challenges never complete
    pub fn stall_domain(&self, domain: &str) {
        self.stalled_domains.insert(domain.to_string());
    }

    /// Clear failure and stall scripting
    pub fn heal(&self) {
        self.failing_domains.clear();
        self.stalled_domains.clear();
    }

    pub fn reject_revocations(&self, reject: bool) {
        self.reject_revocations.store(reject, Ordering::SeqCst);
    }

    pub fn fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    /// Challenges requested so far
    pub fn challenge_requests(&self) -> usize {
        self.challenge_requests.load(Ordering::SeqCst)
    }

    /// Finalizations so far
    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    /// Revocation reason recorded for a certificate, if revoked
    pub fn revocation_reason(&self, certificate_pem: &str) -> Option<RevocationReason> {
        let issued = self.issued.lock().ok()?;
        issued
            .get(certificate_pem)
            .filter(|info| info.revoked)
            .and_then(|info| info.revocation_reason)
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Generate a mock certificate
    fn generate_mock_certificate(domains: &[String], serial: &str, not_after: &str) -> String {
        let body = serde_json::json!({
            "serial": serial,
            "issuer": "CN=Mock ACME CA",
            "sans": domains,
            "not_after": not_after,
        });
        let encoded = STANDARD.encode(body.to_string());
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    /// Generate a mock CA certificate
    fn generate_mock_ca_cert() -> String {
        "-----BEGIN CERTIFICATE-----\n\
        TW9jayBBQ01FIENBIEludGVybWVkaWF0ZQ==\n\
        -----END CERTIFICATE-----\n".to_string()
    }
}

#[async_trait]
impl AcmeClient for MockAcmeClient {
    async fn request_challenge(&self, domain: &str, challenge_type: ChallengeType) -> Result<ChallengeGrant> {
        debug!(domain = %domain, challenge_type = %challenge_type, "Mock CA: issuing challenge");
        self.challenge_requests.fetch_add(1, Ordering::SeqCst);

        if domain.starts_with("*.") && challenge_type == ChallengeType::Http01 {
            return Err(Error::Acme(format!("http-01 is not offered for wildcard {}", domain)));
        }

        let token = Self::random_token();
        self.tokens.insert(domain.to_string(), token.clone());
        self.polls.insert(domain.to_string(), 0);
        self.validated.remove(domain);

        Ok(ChallengeGrant {
            key_authorization: format!("{}.{}", token, self.thumbprint),
            token,
        })
    }

    async fn validate(&self, domain: &str, token: &str) -> Result<ChallengeStatus> {
        let expected = self
            .tokens
            .get(domain)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::Acme(format!("no outstanding challenge for {}", domain)))?;
        if expected != token {
            return Ok(ChallengeStatus::Invalid);
        }

        if self.stalled_domains.contains(domain) {
            return Ok(ChallengeStatus::Pending);
        }
        if self.failing_domains.contains(domain) {
            return Ok(ChallengeStatus::Invalid);
        }

        let polls = {
            let mut entry = self.polls.entry(domain.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if polls >= self.polls_until_valid.load(Ordering::SeqCst) {
            self.validated.insert(domain.to_string());
            Ok(ChallengeStatus::Valid)
        } else {
            Ok(ChallengeStatus::Pending)
        }
    }

    async fn finalize(&self, csr_pem: &str, domains: &[String]) -> Result<IssuedCertificate> {
        debug!(domains = ?domains, "Mock CA: finalizing order");
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(Error::Acme("order finalization rejected".into()));
        }
        if !csr_pem.starts_with("-----BEGIN CERTIFICATE REQUEST-----") {
            return Err(Error::Acme("malformed CSR".into()));
        }
        if let Some(missing) = domains.iter().find(|d| !self.validated.contains(d.as_str())) {
            return Err(Error::Acme(format!("authorization for {} is not valid", missing)));
        }

        let not_before = Utc::now();
        let not_after = not_before + chrono::Duration::days(self.validity_days);
        let serial = format!("{:016X}", rand::random::<u64>());
        let certificate_pem = Self::generate_mock_certificate(domains, &serial, &not_after.to_rfc3339());

        let info = MockCertInfo {
            domains: domains.to_vec(),
            revoked: false,
            revocation_reason: None,
        };
        self.issued
            .lock()
            .map_err(|_| Error::Internal("mock CA state poisoned".into()))?
            .insert(certificate_pem.clone(), info);

        Ok(IssuedCertificate {
            certificate_pem,
            chain_pem: Some(Self::generate_mock_ca_cert()),
            not_before,
            not_after,
        })
    }

    async fn revoke(&self, certificate_pem: &str, reason: RevocationReason) -> Result<()> {
        debug!(reason = %reason, code = reason.code(), "Mock CA: revoking certificate");
        if self.reject_revocations.load(Ordering::SeqCst) {
            return Err(Error::Acme("revocation rejected by CA".into()));
        }

        let mut issued = self
            .issued
            .lock()
            .map_err(|_| Error::Internal("mock CA state poisoned".into()))?;

        match issued.get_mut(certificate_pem) {
            Some(info) if info.revoked => Err(Error::Acme("certificate already revoked".into())),
            Some(info) => {
                debug!(domains = ?info.domains, "Mock CA: certificate revoked");
                info.revoked = true;
                info.revocation_reason = Some(reason);
                Ok(())
            }
            None => Err(Error::Acme("unknown certificate".into())),
        }
    }
}
