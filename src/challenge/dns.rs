use std::sync::Arc;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::Settings;
use crate::error::Error;
use crate::types::Result;

/// TXT record label for DNS-01
pub const DNS01_RECORD_PREFIX: &str = "_acme-challenge";

/// DNS provider capability used for DNS-01 records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a TXT record
    async fn create_txt_record(&self, zone: &str, name: &str, value: &str) -> Result<()>;

    /// Delete a TXT record
    async fn delete_txt_record(&self, zone: &str, name: &str, value: &str) -> Result<()>;
}

/// TXT value for a key authorization: base64url(SHA-256(key_authorization))
pub fn dns01_txt_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Record name for a domain; wildcards validate at the base name
pub fn dns01_record_name(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    format!("{}.{}", DNS01_RECORD_PREFIX, base)
}

/// Zone hosting a domain: the configured zone, or the last two labels
pub fn dns01_zone(domain: &str, configured: Option<&str>) -> String {
    if let Some(zone) = configured.filter(|z| !z.is_empty()) {
        return zone.trim_end_matches('.').to_string();
    }

    let base = domain.strip_prefix("*.").unwrap_or(domain);
    let labels: Vec<&str> = base.split('.').collect();
    if labels.len() <= 2 {
        base.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// In-memory DNS provider
#[derive(Debug, Default)]
pub struct InMemoryDnsProvider {
    /// (zone, name) -> values
    records: DashMap<(String, String), Vec<String>>,
    /// Fail every call when set
    failing: std::sync::atomic::AtomicBool,
}

impl InMemoryDnsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    /// Values currently published for a record
    pub fn txt_values(&self, zone: &str, name: &str) -> Vec<String> {
        self.records
            .get(&(zone.to_string(), name.to_string()))
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Total number of published values
    pub fn record_count(&self) -> usize {
        self.records.iter().map(|entry| entry.value().len()).sum()
    }

    async fn call(&self) -> Result<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Dns("DNS provider unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for InMemoryDnsProvider {
    async fn create_txt_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        self.call().await?;
        debug!(zone = %zone, name = %name, "Creating TXT record");
        let mut values = self
            .records
            .entry((zone.to_string(), name.to_string()))
            .or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        Ok(())
    }

    async fn delete_txt_record(&self, zone: &str, name: &str, value: &str) -> Result<()> {
        self.call().await?;
        debug!(zone = %zone, name = %name, "Deleting TXT record");
        let key = (zone.to_string(), name.to_string());
        if let Some(mut values) = self.records.get_mut(&key) {
            values.retain(|v| v != value);
        }
        self.records.remove_if(&key, |_, values| values.is_empty());
        Ok(())
    }
}

/// Create a DNS provider based on configuration
pub fn create_dns_provider(config: &Settings) -> Result<Arc<dyn DnsProvider>> {
    match config.challenge.dns_provider.as_str() {
        "memory" => Ok(Arc::new(InMemoryDnsProvider::new())),
        name @ ("cloudflare" | "route53" | "azure-dns") => Err(Error::Config(format!(
            "DNS provider '{}' must be supplied by the embedding application",
            name
        ))),
        other => Err(Error::Config(format!("Unsupported DNS provider: {}", other))),
    }
}
