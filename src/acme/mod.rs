pub mod types;
pub mod provider;
pub mod mock;

// Re-export key types
pub use types::{
    ChallengeGrant, ChallengeRequest, ChallengeStatus, ChallengeType, IssuedCertificate, RevocationReason,
};
pub use provider::{AcmeClient, create_acme_client};
pub use mock::MockAcmeClient;
