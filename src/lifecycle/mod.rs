pub mod state;
pub mod machine;

// Re-export key types
pub use state::{CertificateState, LifecycleEvent, next_state};
pub use machine::{LifecycleStateMachine, LifecycleGuard, LifecycleRecord, DEFAULT_MAX_RETRIES};
