pub mod orchestrator;

pub use orchestrator::{CertificateOrchestrator, OrchestratorOptions, PersistReport};
