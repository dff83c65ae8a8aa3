use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::domain::Certificate;
use crate::error::Error;
use crate::store::{CertificateFilter, CertificateStore};
use crate::types::Result;

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    certificates: DashMap<String, Certificate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, certificate: &Certificate) -> Result<Certificate> {
        certificate.validate()?;
        self.certificates.insert(certificate.id.clone(), certificate.clone());
        Ok(certificate.clone())
    }

    async fn get(&self, id: &str) -> Result<Certificate> {
        self.certificates
            .get(id)
            .map(|c| c.clone())
            .ok_or_else(|| Error::NotFound(format!("Certificate {}", id)))
    }

    async fn list(&self, filter: &CertificateFilter) -> Result<Vec<Certificate>> {
        let now = Utc::now();
        let mut certificates: Vec<Certificate> = self
            .certificates
            .iter()
            .filter(|entry| filter.matches(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();
        certificates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(certificates)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.certificates
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Certificate {}", id)))
    }
}
