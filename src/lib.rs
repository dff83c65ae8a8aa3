//! certpilot - ACME certificate lifecycle orchestrator
//!
//! Issues, renews, revokes and propagates TLS certificates, keeping private
//! keys encrypted at rest and replicating certificates to regional cloud
//! stores.

// Foundational layer
pub mod error;
pub mod types;
pub mod utils;
pub mod config;
pub mod telemetry;

// Core layer
pub mod crypto;
pub mod domain;
pub mod lifecycle;
pub mod acme;
pub mod challenge;
pub mod cloud;
pub mod store;
pub mod propagation;

// Application layer
pub mod service;
pub mod controller;

// Interface layer
pub mod api;

// Public key types
pub use crate::error::Error;
pub use crate::types::{KeyAlgorithm, Result};
pub use crate::config::Settings;
pub use crate::domain::{Certificate, CertificateSummary, IssueRequest};
pub use crate::lifecycle::{CertificateState, LifecycleStateMachine};
pub use crate::service::CertificateOrchestrator;
pub use crate::controller::{HealthReport, RenewalScheduler};
pub use crate::telemetry::metrics::MetricsCollector;
