pub mod health;
pub mod scheduler;

// Re-export key types
pub use health::{HealthReport, HealthStatus};
pub use scheduler::{RenewalClaim, RenewalJobState, RenewalScheduler, SweepReport};
