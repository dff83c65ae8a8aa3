use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::error::Error;

/// ACME challenge type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    /// Token served over plain HTTP on port 80
    #[serde(rename = "http-01")]
    Http01,
    /// TXT record under `_acme-challenge`
    #[serde(rename = "dns-01")]
    Dns01,
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeType::Http01 => write!(f, "http-01"),
            ChallengeType::Dns01 => write!(f, "dns-01"),
        }
    }
}

impl FromStr for ChallengeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http-01" | "http01" | "http" => Ok(ChallengeType::Http01),
            "dns-01" | "dns01" | "dns" => Ok(ChallengeType::Dns01),
            other => Err(Error::InvalidRequest(format!("Unsupported challenge type: {}", other))),
        }
    }
}

/// Status of a single domain challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
    /// Validation did not finish before the deadline
    Expired,
}

impl ChallengeStatus {
    /// Whether polling can stop
    pub fn is_final(&self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeStatus::Pending => write!(f, "pending"),
            ChallengeStatus::Valid => write!(f, "valid"),
            ChallengeStatus::Invalid => write!(f, "invalid"),
            ChallengeStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Challenge handed out by the CA for one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeGrant {
    /// Challenge token
    pub token: String,
    /// Key authorization (`token.thumbprint`)
    pub key_authorization: String,
}

/// In-flight challenge for one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    /// Domain being validated
    pub domain: String,
    /// Challenge type
    pub challenge_type: ChallengeType,
    /// Challenge token
    pub token: String,
    /// Value the CA expects to find (HTTP body or TXT record)
    pub validation_value: String,
    /// Current status
    pub status: ChallengeStatus,
}

/// Certificate returned by the CA after finalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Leaf certificate PEM
    pub certificate_pem: String,
    /// Intermediate chain PEM
    pub chain_pem: Option<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// Revocation reason (RFC 5280)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    #[serde(rename = "unspecified")]
    Unspecified = 0,
    #[serde(rename = "keyCompromise")]
    KeyCompromise = 1,
    #[serde(rename = "cACompromise")]
    CaCompromise = 2,
    #[serde(rename = "affiliationChanged")]
    AffiliationChanged = 3,
    #[serde(rename = "superseded")]
    Superseded = 4,
    #[serde(rename = "cessationOfOperation")]
    CessationOfOperation = 5,
    #[serde(rename = "certificateHold")]
    CertificateHold = 6,
    #[serde(rename = "removeFromCRL")]
    RemoveFromCrl = 8,
    #[serde(rename = "privilegeWithdrawn")]
    PrivilegeWithdrawn = 9,
    #[serde(rename = "aACompromise")]
    AaCompromise = 10,
}

impl RevocationReason {
    /// RFC 5280 reason code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Wire name passed through to the CA
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "keyCompromise",
            Self::CaCompromise => "cACompromise",
            Self::AffiliationChanged => "affiliationChanged",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessationOfOperation",
            Self::CertificateHold => "certificateHold",
            Self::RemoveFromCrl => "removeFromCRL",
            Self::PrivilegeWithdrawn => "privilegeWithdrawn",
            Self::AaCompromise => "aACompromise",
        }
    }
}

impl Default for RevocationReason {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = Error;

    fn from_str(reason: &str) -> Result<Self, Self::Err> {
        let normalized: String = reason
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "keycompromise" => Ok(Self::KeyCompromise),
            "cacompromise" => Ok(Self::CaCompromise),
            "affiliationchanged" => Ok(Self::AffiliationChanged),
            "superseded" => Ok(Self::Superseded),
            "cessationofoperation" => Ok(Self::CessationOfOperation),
            "certificatehold" => Ok(Self::CertificateHold),
            "removefromcrl" => Ok(Self::RemoveFromCrl),
            "privilegewithdrawn" => Ok(Self::PrivilegeWithdrawn),
            "aacompromise" => Ok(Self::AaCompromise),
            _ => Err(Error::InvalidRequest(format!("Unknown revocation reason: {}", reason))),
        }
    }
}
