pub mod http01;
pub mod dns;
pub mod coordinator;

// Re-export key types
pub use http01::{Http01Responder, ACME_CHALLENGE_PREFIX};
pub use dns::{
    DnsProvider, InMemoryDnsProvider, create_dns_provider,
    dns01_record_name, dns01_txt_value, dns01_zone,
};
pub use coordinator::{ChallengeCoordinator, DomainOutcome, ValidationResult, DEFAULT_MAX_CONCURRENCY};
