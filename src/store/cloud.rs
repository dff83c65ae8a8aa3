use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cloud::{CertificateBundle, CloudStoreAdapter};
use crate::domain::Certificate;
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::store::{CertificateFilter, CertificateStore};
use crate::types::Result;

/// Store that imports material into a cloud certificate store.
///
/// `put` imports the bundle and then persists metadata (with the returned
/// handle) in the inner store. State-only updates, and records that are no
/// longer deployable (REVOKED, EXPIRED), skip the import and only rewrite
/// metadata. Reads and deletes only touch the inner store.
pub struct CloudDelegatingStore {
    adapter: Arc<dyn CloudStoreAdapter>,
    region: String,
    metadata: Arc<dyn CertificateStore>,
}

impl CloudDelegatingStore {
    pub fn new(adapter: Arc<dyn CloudStoreAdapter>, region: String, metadata: Arc<dyn CertificateStore>) -> Self {
        Self {
            adapter,
            region,
            metadata,
        }
    }

    /// Key under which the import handle is recorded
    pub fn handle_key(&self) -> String {
        format!("{}/{}", self.adapter.provider(), self.region)
    }

    /// Handle of an earlier import of the same material
    async fn imported_handle(&self, certificate: &Certificate) -> Result<Option<String>> {
        let existing = match self.metadata.get(&certificate.id).await {
            Ok(existing) => existing,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let unchanged = existing.certificate_pem == certificate.certificate_pem
            && existing.private_key_pem == certificate.private_key_pem;
        Ok(existing
            .external_handles
            .get(&self.handle_key())
            .filter(|_| unchanged)
            .cloned())
    }
}

fn is_deployable(state: CertificateState) -> bool {
    matches!(state, CertificateState::Active | CertificateState::Renewing)
}

#[async_trait]
impl CertificateStore for CloudDelegatingStore {
    fn backend_name(&self) -> &'static str {
        self.adapter.provider().as_str()
    }

    async fn put(&self, certificate: &Certificate) -> Result<Certificate> {
        certificate.validate()?;

        let mut stored = certificate.clone();
        let key = self.handle_key();

        if !is_deployable(certificate.state) {
            debug!(id = %certificate.id, state = %certificate.state, "Recording state without cloud import");
            return self.metadata.put(&stored).await;
        }

        if let Some(handle) = self.imported_handle(certificate).await? {
            debug!(id = %certificate.id, provider = %self.adapter.provider(), "Material unchanged; keeping cloud import");
            stored.external_handles.insert(key, handle);
            return self.metadata.put(&stored).await;
        }

        let bundle = CertificateBundle {
            certificate_pem: certificate.certificate_pem.clone(),
            chain_pem: certificate.chain_pem.clone(),
            private_key_pem: certificate.private_key_pem.clone(),
        };

        let handle = self
            .adapter
            .import_certificate(&self.region, &certificate.id, &bundle)
            .await
            .map_err(|e| {
                warn!(id = %certificate.id, provider = %self.adapter.provider(), error = %e, "Cloud import failed");
                Error::StoreUnavailable(format!("{} import failed: {}", self.adapter.provider(), e))
            })?;

        stored.external_handles.insert(key, handle);
        debug!(id = %certificate.id, provider = %self.adapter.provider(), "Imported certificate into cloud store");

        self.metadata.put(&stored).await
    }

    async fn get(&self, id: &str) -> Result<Certificate> {
        self.metadata.get(id).await
    }

    async fn list(&self, filter: &CertificateFilter) -> Result<Vec<Certificate>> {
        self.metadata.list(filter).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.metadata.delete(id).await
    }
}
