pub mod adapter;
pub mod memory;

// Re-export key types
pub use adapter::{CertificateBundle, CloudAdapterRegistry, CloudProvider, CloudStoreAdapter};
pub use memory::InMemoryCloudStore;

#[cfg(test)]
pub use adapter::MockCloudStoreAdapter;
