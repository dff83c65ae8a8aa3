pub mod memory;
pub mod local;
pub mod cloud;

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::cloud::{CloudAdapterRegistry, CloudProvider};
use crate::config::Settings;
use crate::domain::Certificate;
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::types::Result;

// Re-export key types
pub use memory::MemoryStore;
pub use local::LocalEncryptedStore;
pub use cloud::CloudDelegatingStore;

/// Persistence capability for certificates.
///
/// Writes are serialized per id by the lifecycle lock held by callers;
/// reads take no locks.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Backend name for logs and health output
    fn backend_name(&self) -> &'static str;

    /// Insert or replace a certificate; returns what was persisted
    async fn put(&self, certificate: &Certificate) -> Result<Certificate>;

    /// Fetch a certificate
    async fn get(&self, id: &str) -> Result<Certificate>;

    /// Certificates matching a filter, ordered by id
    async fn list(&self, filter: &CertificateFilter) -> Result<Vec<Certificate>>;

    /// Remove a certificate
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Selection criteria for [`CertificateStore::list`]
#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    /// Any of these states
    pub states: Option<Vec<CertificateState>>,
    pub auto_renew: Option<bool>,
    /// Expiring within this window of now (already expired included)
    pub expiring_within: Option<Duration>,
    /// Carries this domain
    pub domain: Option<String>,
}

impl CertificateFilter {
    /// Match everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Only certificates in `state`
    pub fn in_state(state: CertificateState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Self::default()
        }
    }

    /// Active auto-renew certificates inside the renewal window
    pub fn renewal_candidates(threshold: Duration) -> Self {
        Self {
            states: Some(vec![CertificateState::Active]),
            auto_renew: Some(true),
            expiring_within: Some(threshold),
            domain: None,
        }
    }

    pub fn matches(&self, certificate: &Certificate, now: DateTime<Utc>) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&certificate.state) {
                return false;
            }
        }
        if let Some(auto_renew) = self.auto_renew {
            if certificate.auto_renew != auto_renew {
                return false;
            }
        }
        if let Some(window) = self.expiring_within {
            if certificate.expires_at - now > window {
                return false;
            }
        }
        if let Some(domain) = &self.domain {
            let domain = domain.to_ascii_lowercase();
            if !certificate.domains.iter().any(|d| *d == domain) {
                return false;
            }
        }
        true
    }
}

/// Classify a raw I/O failure from a store backend.
///
/// Permission problems cannot heal by retrying; everything else is treated
/// as a transient outage.
pub(crate) fn classify_io(err: Error) -> Error {
    match err {
        Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Error::StoreCorrupted(format!("Permission denied: {}", e))
        }
        Error::Io(e) => Error::StoreUnavailable(e.to_string()),
        other => other,
    }
}

/// Create a certificate store based on configuration
pub async fn create_certificate_store(
    config: &Settings,
    registry: &CloudAdapterRegistry,
) -> Result<Arc<dyn CertificateStore>> {
    match config.store.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "local" => {
            let store = LocalEncryptedStore::open(
                &config.store.root_dir,
                &config.store.key_file,
                config.store.kdf_iterations,
            )
            .await?;
            Ok(Arc::new(store))
        }
        backend => {
            let provider: CloudProvider = backend
                .parse()
                .map_err(|_| Error::Config(format!("Unsupported store backend: {}", backend)))?;
            let adapter = registry.require(provider)?;
            let metadata = LocalEncryptedStore::open(
                &config.store.root_dir,
                &config.store.key_file,
                config.store.kdf_iterations,
            )
            .await?;
            Ok(Arc::new(CloudDelegatingStore::new(
                adapter,
                config.store.cloud_region.clone(),
                Arc::new(metadata),
            )))
        }
    }
}
