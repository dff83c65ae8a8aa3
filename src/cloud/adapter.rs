use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};

use crate::error::Error;
use crate::types::Result;

/// Cloud certificate store family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudProvider {
    AwsAcm,
    AzureKeyVault,
    GcpCertificateManager,
}

impl CloudProvider {
    pub const ALL: [CloudProvider; 3] = [
        CloudProvider::AwsAcm,
        CloudProvider::AzureKeyVault,
        CloudProvider::GcpCertificateManager,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::AwsAcm => "aws-acm",
            CloudProvider::AzureKeyVault => "azure-key-vault",
            CloudProvider::GcpCertificateManager => "gcp-certificate-manager",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws-acm" | "aws" | "acm" => Ok(CloudProvider::AwsAcm),
            "azure-key-vault" | "azure" | "keyvault" => Ok(CloudProvider::AzureKeyVault),
            "gcp-certificate-manager" | "gcp" => Ok(CloudProvider::GcpCertificateManager),
            other => Err(Error::Config(format!("Unknown cloud provider: {}", other))),
        }
    }
}

/// Material handed to a cloud store
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub certificate_pem: String,
    pub chain_pem: Option<String>,
    pub private_key_pem: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("certificate_pem", &self.certificate_pem.len())
            .field("chain_pem", &self.chain_pem.as_ref().map(|c| c.len()))
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Cloud certificate store capability.
///
/// `import_certificate` is an upsert keyed by `name` within a region and
/// returns an opaque handle for later lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudStoreAdapter: Send + Sync {
    /// Provider this adapter talks to
    fn provider(&self) -> CloudProvider;

    /// Import or replace a certificate
    async fn import_certificate(&self, region: &str, name: &str, bundle: &CertificateBundle) -> Result<String>;

    /// Fetch a certificate by handle
    async fn get_certificate(&self, region: &str, handle: &str) -> Result<CertificateBundle>;

    /// Remove a certificate by handle
    async fn delete_certificate(&self, region: &str, handle: &str) -> Result<()>;
}

/// Provider -> adapter lookup
#[derive(Clone, Default)]
pub struct CloudAdapterRegistry {
    adapters: HashMap<CloudProvider, Arc<dyn CloudStoreAdapter>>,
}

impl CloudAdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an in-memory store for every provider
    pub fn simulated() -> Self {
        let mut registry = Self::new();
        for provider in CloudProvider::ALL {
            registry.register(Arc::new(crate::cloud::memory::InMemoryCloudStore::new(provider)));
        }
        registry
    }

    /// Register an adapter under its own provider, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn CloudStoreAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: CloudProvider) -> Option<Arc<dyn CloudStoreAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Adapter for a provider, or a configuration error naming it
    pub fn require(&self, provider: CloudProvider) -> Result<Arc<dyn CloudStoreAdapter>> {
        self.get(provider).ok_or_else(|| {
            Error::Config(format!("No cloud store adapter registered for provider {}", provider))
        })
    }

    pub fn providers(&self) -> Vec<CloudProvider> {
        self.adapters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert_eq!("aws-acm".parse::<CloudProvider>().unwrap(), CloudProvider::AwsAcm);
        assert_eq!("GCP".parse::<CloudProvider>().unwrap(), CloudProvider::GcpCertificateManager);
        assert!("oracle".parse::<CloudProvider>().is_err());
        assert_eq!(
            serde_json::to_string(&CloudProvider::AzureKeyVault).unwrap(),
            "\"azure-key-vault\""
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CloudAdapterRegistry::simulated();
        assert_eq!(registry.providers().len(), 3);
        assert!(registry.require(CloudProvider::AwsAcm).is_ok());

        let empty = CloudAdapterRegistry::new();
        let err = empty.require(CloudProvider::AwsAcm).err().unwrap();
        assert!(err.to_string().contains("aws-acm"));
    }

    #[test]
    fn test_bundle_debug_redacts_key() {
        let bundle = CertificateBundle {
            certificate_pem: "CERT".into(),
            chain_pem: None,
            private_key_pem: "SECRET".into(),
        };
        assert!(!format!("{:?}", bundle).contains("SECRET"));
    }
}
