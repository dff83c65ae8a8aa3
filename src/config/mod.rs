pub mod settings;

// Re-export key types
pub use settings::{
    AcmeConfig, ApiConfig, ChallengeConfig, LifecycleConfig, PropagationConfig,
    RenewalConfig, Settings, StoreConfig, TelemetryConfig, ENV_PREFIX,
};
