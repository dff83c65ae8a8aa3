pub mod types;
pub mod engine;

// Re-export key types
pub use types::{
    PropagationResult, PropagationStatus, PropagationStrategy,
    RegionConfig, RegionOutcome, RegionResult,
};
pub use engine::{PropagationEngine, CANCELLED_DETAIL};
