pub mod cert;

// Re-export key types
pub use cert::{
    Certificate, CertificateSummary, IssueRequest, SubjectInfo,
    has_wildcard, normalize_domains, validate_id, MAX_DOMAINS,
};
