pub mod cipher;
pub mod csr;

// Re-export key types
pub use cipher::{KeyCipher, DEFAULT_KDF_ITERATIONS};
pub use csr::{generate_csr, GeneratedCsr};
