use std::collections::{BTreeMap, HashSet};
use std::fmt;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Deserialize};

use crate::acme::{ChallengeType, RevocationReason};
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::types::{KeyAlgorithm, Result};

/// Maximum number of names on one certificate
pub const MAX_DOMAINS: usize = 100;

/// Subject distinguished-name fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectInfo {
    pub organization: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
}

/// A managed certificate with its key material.
///
/// The private key is held in memory only; stores encrypt it at rest and the
/// `Debug` rendering redacts it.
#[derive(Clone)]
pub struct Certificate {
    /// Stable identifier, retained across renewals
    pub id: String,
    /// Ordered SANs; the first may be a wildcard
    pub domains: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Leaf certificate PEM
    pub certificate_pem: String,
    /// Intermediate chain PEM
    pub chain_pem: Option<String>,
    /// Private key PEM
    pub private_key_pem: String,
    pub key_algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub subject: SubjectInfo,
    pub auto_renew: bool,
    pub state: CertificateState,
    /// Challenge type used for the last issuance or renewal
    pub challenge_type: ChallengeType,
    pub retry_count: u32,
    pub revocation_reason: Option<RevocationReason>,
    /// Backend name -> handle returned by a cloud store import
    pub external_handles: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl Certificate {
    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidRequest("Certificate id must not be empty".into()));
        }
        if self.domains.is_empty() {
            return Err(Error::InvalidRequest(format!("Certificate {} has no domains", self.id)));
        }
        if self.expires_at <= self.issued_at {
            return Err(Error::InvalidRequest(format!(
                "Certificate {} expires at {} which is not after issuance at {}",
                self.id, self.expires_at, self.issued_at
            )));
        }
        Ok(())
    }

    /// Whether the certificate is past its expiration at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiration (negative once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Public view without key material
    pub fn summary(&self) -> CertificateSummary {
        CertificateSummary {
            id: self.id.clone(),
            domains: self.domains.clone(),
            state: self.state,
            issued_at: Some(self.issued_at),
            expires_at: Some(self.expires_at),
            certificate_pem: Some(self.certificate_pem.clone()),
            chain_pem: self.chain_pem.clone(),
            key_algorithm: self.key_algorithm,
            key_size: self.key_size,
            subject: self.subject.clone(),
            auto_renew: self.auto_renew,
            challenge_type: self.challenge_type,
            retry_count: self.retry_count,
            revocation_reason: self.revocation_reason,
            external_handles: self.external_handles.clone(),
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("domains", &self.domains)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("key_algorithm", &self.key_algorithm)
            .field("private_key_pem", &"<redacted>")
            .field("auto_renew", &self.auto_renew)
            .field("state", &self.state)
            .field("challenge_type", &self.challenge_type)
            .field("retry_count", &self.retry_count)
            .field("revocation_reason", &self.revocation_reason)
            .finish_non_exhaustive()
    }
}

/// Certificate as exposed to callers; never carries the private key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub id: String,
    pub domains: Vec<String>,
    pub state: CertificateState,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub certificate_pem: Option<String>,
    pub chain_pem: Option<String>,
    pub key_algorithm: KeyAlgorithm,
    pub key_size: u32,
    pub subject: SubjectInfo,
    pub auto_renew: bool,
    pub challenge_type: ChallengeType,
    pub retry_count: u32,
    pub revocation_reason: Option<RevocationReason>,
    #[serde(default)]
    pub external_handles: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

fn default_auto_renew() -> bool {
    true
}

/// Request to issue a new certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub domains: Vec<String>,
    #[serde(default)]
    pub subject: SubjectInfo,
    #[serde(default = "default_auto_renew")]
    pub auto_renew: bool,
    /// Challenge type; DNS-01 for wildcards, HTTP-01 otherwise when absent
    #[serde(default)]
    pub challenge_type: Option<ChallengeType>,
    #[serde(default)]
    pub key_algorithm: Option<KeyAlgorithm>,
}

impl IssueRequest {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            id: None,
            domains,
            subject: SubjectInfo::default(),
            auto_renew: true,
            challenge_type: None,
            key_algorithm: None,
        }
    }

    /// Validate and normalize the domain list in place
    pub fn normalize(mut self) -> Result<Self> {
        self.domains = normalize_domains(&self.domains)?;
        if let Some(id) = &self.id {
            validate_id(id)?;
        }
        if self.challenge_type == Some(ChallengeType::Http01) && has_wildcard(&self.domains) {
            return Err(Error::InvalidRequest(
                "Wildcard domains require the dns-01 challenge".into(),
            ));
        }
        Ok(self)
    }

    /// Challenge type to use for this request
    pub fn effective_challenge_type(&self) -> ChallengeType {
        match self.challenge_type {
            Some(challenge_type) => challenge_type,
            None if has_wildcard(&self.domains) => ChallengeType::Dns01,
            None => ChallengeType::Http01,
        }
    }
}

/// Whether any name in the list is a wildcard
pub fn has_wildcard(domains: &[String]) -> bool {
    domains.iter().any(|d| d.starts_with("*."))
}

/// Certificate ids become directory names, so keep them to a safe alphabet
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("Invalid certificate id: {:?}", id)))
    }
}

/// Lower-case and validate a domain list.
///
/// Rejects empty or oversized lists, duplicates, malformed names and
/// wildcards anywhere but the first position.
pub fn normalize_domains(domains: &[String]) -> Result<Vec<String>> {
    if domains.is_empty() {
        return Err(Error::InvalidRequest("At least one domain is required".into()));
    }
    if domains.len() > MAX_DOMAINS {
        return Err(Error::InvalidRequest(format!(
            "At most {} domains are allowed, got {}",
            MAX_DOMAINS,
            domains.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(domains.len());

    for (index, raw) in domains.iter().enumerate() {
        let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();

        let name = match domain.strip_prefix("*.") {
            Some(_) if index > 0 => {
                return Err(Error::InvalidRequest(format!(
                    "Only the first domain may be a wildcard: {}",
                    raw
                )));
            }
            Some(rest) => rest,
            None => domain.as_str(),
        };

        if !is_valid_dns_name(name) {
            return Err(Error::InvalidRequest(format!("Invalid domain name: {}", raw)));
        }
        if !seen.insert(domain.clone()) {
            return Err(Error::InvalidRequest(format!("Duplicate domain: {}", domain)));
        }

        normalized.push(domain);
    }

    Ok(normalized)
}

fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    })
}
