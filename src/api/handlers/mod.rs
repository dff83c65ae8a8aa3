pub mod certificates;
pub mod health;
pub mod metrics;
pub mod propagations;
