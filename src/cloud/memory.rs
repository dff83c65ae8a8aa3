use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::cloud::adapter::{CertificateBundle, CloudProvider, CloudStoreAdapter};
use crate::error::Error;
use crate::types::Result;

/// Simulated cloud certificate store.
///
/// Each region is independent; latency and failures can be injected per
/// region to model backends with different characteristics.
pub struct InMemoryCloudStore {
    provider: CloudProvider,
    /// (region, handle) -> bundle
    objects: DashMap<(String, String), CertificateBundle>,
    /// (region, name) -> handle
    names: DashMap<(String, String), String>,
    latency: DashMap<String, Duration>,
    failing_regions: DashSet<String>,
    imports: AtomicUsize,
}

impl InMemoryCloudStore {
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            objects: DashMap::new(),
            names: DashMap::new(),
            latency: DashMap::new(),
            failing_regions: DashSet::new(),
            imports: AtomicUsize::new(0),
        }
    }

    /// Delay every call in a region
    pub fn set_region_latency(&self, region: &str, latency: Duration) {
        self.latency.insert(region.to_string(), latency);
    }

    /// Make a region reject every call
    pub fn fail_region(&self, region: &str) {
        self.failing_regions.insert(region.to_string());
    }

    pub fn restore_region(&self, region: &str) {
        self.failing_regions.remove(region);
    }

    /// Successful imports so far
    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    /// Number of certificates held in a region
    pub fn certificate_count(&self, region: &str) -> usize {
        self.objects.iter().filter(|entry| entry.key().0 == region).count()
    }

    fn handle_for(&self, region: &str, name: &str) -> String {
        match self.provider {
            CloudProvider::AwsAcm => format!(
                "arn:aws:acm:{}:000000000000:certificate/{}",
                region,
                uuid::Uuid::new_v4()
            ),
            CloudProvider::AzureKeyVault => format!("https://{}.vault.azure.net/certificates/{}", region, name),
            CloudProvider::GcpCertificateManager => {
                format!("projects/certpilot/locations/{}/certificates/{}", region, name)
            }
        }
    }

    async fn enter(&self, region: &str) -> Result<()> {
        let latency = self.latency.get(region).map(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing_regions.contains(region) {
            return Err(Error::CloudStore(format!(
                "{} region {} is unavailable",
                self.provider, region
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudStoreAdapter for InMemoryCloudStore {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn import_certificate(&self, region: &str, name: &str, bundle: &CertificateBundle) -> Result<String> {
        self.enter(region).await?;

        let key = (region.to_string(), name.to_string());
        let handle = match self.names.get(&key) {
            Some(existing) => existing.clone(),
            None => self.handle_for(region, name),
        };
        self.names.insert(key, handle.clone());
        self.objects.insert((region.to_string(), handle.clone()), bundle.clone());
        self.imports.fetch_add(1, Ordering::SeqCst);

        debug!(provider = %self.provider, region = %region, name = %name, "Imported certificate");
        Ok(handle)
    }

    async fn get_certificate(&self, region: &str, handle: &str) -> Result<CertificateBundle> {
        self.enter(region).await?;
        self.objects
            .get(&(region.to_string(), handle.to_string()))
            .map(|bundle| bundle.clone())
            .ok_or_else(|| Error::NotFound(format!("{} certificate {} in {}", self.provider, handle, region)))
    }

    async fn delete_certificate(&self, region: &str, handle: &str) -> Result<()> {
        self.enter(region).await?;
        self.objects.remove(&(region.to_string(), handle.to_string()));
        self.names.retain(|(r, _), h| !(r == region && h == handle));
        Ok(())
    }
}
