use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::propagation::{PropagationStrategy, RegionConfig};
use crate::types::{KeyAlgorithm, Result};

/// Environment variable prefix for overrides (`CERTPILOT__RENEWAL__WORKERS=8`)
pub const ENV_PREFIX: &str = "CERTPILOT";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// ACME configuration
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Challenge configuration
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Lifecycle configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Renewal scheduler configuration
    #[serde(default)]
    pub renewal: RenewalConfig,

    /// Propagation configuration
    #[serde(default)]
    pub propagation: PropagationConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// REST API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME client implementation (mock)
    pub provider: String,

    /// Directory URL handed to the ACME client
    pub directory_url: String,

    /// Account contact
    pub contact_email: Option<String>,

    /// Validity requested from the CA (days)
    pub validity_days: i64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            directory_url: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            contact_email: None,
            validity_days: 90,
        }
    }
}

/// Challenge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Per-domain validation timeout (seconds)
    pub timeout_secs: u64,

    /// Delay between validation polls (milliseconds)
    pub poll_interval_ms: u64,

    /// Domains validated at once
    pub max_concurrency: usize,

    /// DNS provider (memory, cloudflare, route53, azure-dns)
    pub dns_provider: String,

    /// Zone override for DNS-01 records
    pub dns_zone: Option<String>,

    /// Wait after creating a TXT record (seconds)
    pub dns_propagation_delay_secs: u64,

    /// Serve HTTP-01 tokens
    pub serve_http: bool,

    /// HTTP-01 listener address
    pub http_listen_addr: String,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            poll_interval_ms: 2000,
            max_concurrency: 8,
            dns_provider: "memory".to_string(),
            dns_zone: None,
            dns_propagation_delay_secs: 30,
            serve_http: true,
            http_listen_addr: "0.0.0.0:80".to_string(),
        }
    }
}

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Issuance attempts allowed after the first failure
    pub max_retries: u32,

    /// Renew when this close to expiration (days)
    pub renewal_threshold_days: i64,

    /// Key algorithm when the request does not name one
    pub default_key_algorithm: KeyAlgorithm,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            renewal_threshold_days: 30,
            default_key_algorithm: KeyAlgorithm::EcdsaP256,
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend (local, memory, aws-acm, azure-key-vault, gcp-certificate-manager)
    pub backend: String,

    /// Root directory of the local store
    pub root_dir: PathBuf,

    /// External key file the encryption key is derived from
    pub key_file: PathBuf,

    /// PBKDF2 iterations
    pub kdf_iterations: u32,

    /// Region used by cloud-delegating backends
    pub cloud_region: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            root_dir: PathBuf::from("./data/store"),
            key_file: PathBuf::from("./data/master.key"),
            kdf_iterations: crate::crypto::DEFAULT_KDF_ITERATIONS,
            cloud_region: "us-east-1".to_string(),
        }
    }
}

/// Renewal scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Run the periodic sweep
    pub enabled: bool,

    /// Sweep interval (seconds)
    pub interval_secs: u64,

    /// Concurrent renewals per sweep
    pub workers: usize,

    /// Base backoff after a failed sweep (seconds)
    pub retry_backoff_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 24 * 60 * 60,
            workers: 4,
            retry_backoff_secs: 60,
        }
    }
}

/// Propagation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Default target regions
    pub regions: Vec<RegionConfig>,

    /// Strategy for auto-propagation and requests that omit one
    pub default_strategy: PropagationStrategy,

    /// Regions imported at once
    pub max_concurrency: usize,

    /// Per-region import timeout (seconds)
    pub region_timeout_secs: u64,

    /// Propagate after every issuance and renewal
    pub auto_propagate: bool,

    /// Register in-memory cloud stores for every provider
    pub simulate_backends: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            default_strategy: PropagationStrategy::Sync,
            max_concurrency: 8,
            region_timeout_secs: 30,
            auto_propagate: false,
            simulate_backends: true,
        }
    }
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter when RUST_LOG is unset
    pub log_level: String,

    /// Enable structured (JSON) logging
    pub structured_logging: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            structured_logging: false,
            enable_metrics: true,
        }
    }
}

/// REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the REST API
    pub enabled: bool,

    /// Listen address
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from environment variables and configuration files
    pub fn load() -> Result<Self> {
        Self::build(std::env::var("CONFIG_FILE").ok().as_deref().map(Path::new))
    }

    /// Load configuration from an explicit file plus environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(config_file: Option<&Path>) -> Result<Self> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();

        // Add default values
        builder = builder.add_source(Config::try_from(&Self::default())?);

        // Add configuration from files
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("config/default").required(false));

            let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".into());
            builder = builder.add_source(File::with_name(&format!("config/{}", env)).required(false));
        }

        // Add environment variables
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Renewal threshold as a duration
    pub fn renewal_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.lifecycle.renewal_threshold_days)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge.timeout_secs)
    }

    pub fn region_timeout(&self) -> Duration {
        Duration::from_secs(self.propagation.region_timeout_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal.interval_secs)
    }

    /// Parsed HTTP-01 listener address
    pub fn challenge_address(&self) -> Result<SocketAddr> {
        parse_addr("challenge.http_listen_addr", &self.challenge.http_listen_addr)
    }

    /// Parsed API listener address
    pub fn api_address(&self) -> Result<SocketAddr> {
        parse_addr("api.listen_addr", &self.api.listen_addr)
    }

    /// Check if configuration is valid
    pub fn validate(&self) -> Result<()> {
        if self.acme.provider.is_empty() {
            return Err(Error::Config("ACME provider cannot be empty".into()));
        }
        if self.acme.validity_days <= 0 {
            return Err(Error::Config("ACME validity must be at least one day".into()));
        }
        if self.challenge.timeout_secs == 0 {
            return Err(Error::Config("Challenge timeout cannot be zero".into()));
        }
        if self.challenge.max_concurrency == 0 {
            return Err(Error::Config("Challenge concurrency cannot be zero".into()));
        }
        if self.challenge.dns_provider.is_empty() {
            return Err(Error::Config("DNS provider cannot be empty".into()));
        }
        if self.lifecycle.renewal_threshold_days <= 0 {
            return Err(Error::Config("Renewal threshold must be at least one day".into()));
        }
        if self.store.backend == "local" && self.store.kdf_iterations == 0 {
            return Err(Error::Config("KDF iterations cannot be zero".into()));
        }
        if self.renewal.interval_secs == 0 {
            return Err(Error::Config("Renewal interval cannot be zero".into()));
        }
        if self.renewal.workers == 0 {
            return Err(Error::Config("Renewal workers cannot be zero".into()));
        }
        if self.propagation.max_concurrency == 0 {
            return Err(Error::Config("Propagation concurrency cannot be zero".into()));
        }
        if self.propagation.region_timeout_secs == 0 {
            return Err(Error::Config("Propagation region timeout cannot be zero".into()));
        }
        if self.propagation.auto_propagate && self.propagation.regions.is_empty() {
            return Err(Error::Config("Auto-propagation requires at least one region".into()));
        }

        let mut names = HashSet::new();
        for region in &self.propagation.regions {
            if region.name.is_empty() || region.region.is_empty() {
                return Err(Error::Config("Propagation regions need a name and a region".into()));
            }
            if !names.insert(region.name.as_str()) {
                return Err(Error::Config(format!("Duplicate propagation region: {}", region.name)));
            }
        }

        if self.challenge.serve_http {
            self.challenge_address()?;
        }
        if self.api.enabled {
            self.api_address()?;
        }

        Ok(())
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} '{}': {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use crate::cloud::CloudProvider;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lifecycle.max_retries, 3);
        assert_eq!(settings.renewal.interval_secs, 86_400);
        assert_eq!(settings.lifecycle.renewal_threshold_days, 30);
        assert_eq!(settings.challenge.timeout_secs, 300);
        assert_eq!(settings.propagation.region_timeout_secs, 30);
        assert_eq!(settings.store.kdf_iterations, 600_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[acme]
validity_days = 60

[renewal]
workers = 2

[propagation]
auto_propagate = true
default_strategy = "async"

[[propagation.regions]]
name = "use1"
provider = "aws-acm"
region = "us-east-1"

[[propagation.regions]]
name = "weu"
provider = "azure-key-vault"
region = "westeurope"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.acme.validity_days, 60);
        assert_eq!(settings.renewal.workers, 2);
        assert_eq!(settings.propagation.default_strategy, PropagationStrategy::Async);
        assert_eq!(settings.propagation.regions.len(), 2);
        assert_eq!(settings.propagation.regions[1].provider, CloudProvider::AzureKeyVault);
        // Untouched sections keep their defaults
        assert_eq!(settings.challenge.dns_provider, "memory");
    }

    #[test]
    fn test_validate_rejects_broken_values() {
        let mut settings = Settings::default();
        settings.renewal.workers = 0;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.propagation.auto_propagate = true;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.api.listen_addr = "not-an-address".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        let region = RegionConfig {
            name: "dup".into(),
            provider: CloudProvider::AwsAcm,
            region: "us-east-1".into(),
        };
        settings.propagation.regions = vec![region.clone(), region];
        assert!(settings.validate().is_err());
    }
}
