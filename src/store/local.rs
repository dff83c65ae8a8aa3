use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::acme::{ChallengeType, RevocationReason};
use crate::crypto::KeyCipher;
use crate::domain::{validate_id, Certificate, SubjectInfo};
use crate::error::Error;
use crate::lifecycle::CertificateState;
use crate::store::{classify_io, CertificateFilter, CertificateStore};
use crate::types::{KeyAlgorithm, Result};
use crate::utils::FsUtils;

const SALT_FILE: &str = "salt";
const CERTS_DIR: &str = "certs";
const META_FILE: &str = "meta.json";
const CERT_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";
const KEY_FILE: &str = "key.enc";
const SALT_LEN: usize = 16;

/// Non-secret fields written to `meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertificateMetadata {
    id: String,
    domains: Vec<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    key_algorithm: KeyAlgorithm,
    key_size: u32,
    subject: SubjectInfo,
    auto_renew: bool,
    state: CertificateState,
    challenge_type: ChallengeType,
    retry_count: u32,
    revocation_reason: Option<RevocationReason>,
    #[serde(default)]
    external_handles: BTreeMap<String, String>,
    updated_at: DateTime<Utc>,
}

impl From<&Certificate> for CertificateMetadata {
    fn from(cert: &Certificate) -> Self {
        Self {
            id: cert.id.clone(),
            domains: cert.domains.clone(),
            issued_at: cert.issued_at,
            expires_at: cert.expires_at,
            key_algorithm: cert.key_algorithm,
            key_size: cert.key_size,
            subject: cert.subject.clone(),
            auto_renew: cert.auto_renew,
            state: cert.state,
            challenge_type: cert.challenge_type,
            retry_count: cert.retry_count,
            revocation_reason: cert.revocation_reason,
            external_handles: cert.external_handles.clone(),
            updated_at: cert.updated_at,
        }
    }
}

impl CertificateMetadata {
    fn into_certificate(self, certificate_pem: String, chain_pem: Option<String>, private_key_pem: String) -> Certificate {
        Certificate {
            id: self.id,
            domains: self.domains,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            certificate_pem,
            chain_pem,
            private_key_pem,
            key_algorithm: self.key_algorithm,
            key_size: self.key_size,
            subject: self.subject,
            auto_renew: self.auto_renew,
            state: self.state,
            challenge_type: self.challenge_type,
            retry_count: self.retry_count,
            revocation_reason: self.revocation_reason,
            external_handles: self.external_handles,
            updated_at: self.updated_at,
        }
    }
}

/// Filesystem store with encrypted private keys.
///
/// Layout under the root:
///
/// ```text
/// salt
/// certs/<id>/meta.json
/// certs/<id>/cert.pem
/// certs/<id>/chain.pem
/// certs/<id>/key.enc
/// ```
///
/// `meta.json` is written last and acts as the commit marker for a record.
pub struct LocalEncryptedStore {
    root: PathBuf,
    cipher: Arc<KeyCipher>,
}

impl LocalEncryptedStore {
    /// Open a store, deriving the cipher key from `key_file`.
    ///
    /// A missing key file is created with fresh random material.
    pub async fn open(root: impl AsRef<Path>, key_file: impl AsRef<Path>, iterations: u32) -> Result<Self> {
        let key_file = key_file.as_ref().to_path_buf();

        if FsUtils::read_optional(&key_file).await.map_err(classify_io)?.is_none() {
            warn!(path = %key_file.display(), "Key file not found, generating a new one");
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            FsUtils::write_atomic(&key_file, STANDARD.encode(secret)).await.map_err(classify_io)?;
        }

        let root = root.as_ref().to_path_buf();
        let salt = Self::load_salt(&root).await?;

        let cipher = tokio::task::spawn_blocking(move || KeyCipher::from_key_file(&key_file, &salt, iterations))
            .await
            .map_err(|e| Error::Internal(format!("Key derivation task failed: {}", e)))??;

        info!(root = %root.display(), "Opened encrypted certificate store");
        Ok(Self {
            root,
            cipher: Arc::new(cipher),
        })
    }

    /// Open a store with in-memory secret material
    pub async fn open_with_secret(root: impl AsRef<Path>, secret: &[u8], iterations: u32) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let salt = Self::load_salt(&root).await?;
        let cipher = KeyCipher::derive(secret, &salt, iterations)?;

        Ok(Self {
            root,
            cipher: Arc::new(cipher),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_salt(root: &Path) -> Result<Vec<u8>> {
        FsUtils::ensure_private_dir(root.join(CERTS_DIR)).await.map_err(classify_io)?;
        FsUtils::ensure_private_dir(root).await.map_err(classify_io)?;

        let salt_path = root.join(SALT_FILE);
        match FsUtils::read_optional(&salt_path).await.map_err(classify_io)? {
            Some(salt) if salt.len() == SALT_LEN => Ok(salt),
            Some(_) => Err(Error::StoreCorrupted(format!(
                "Salt file {} has the wrong length",
                salt_path.display()
            ))),
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                FsUtils::write_atomic(&salt_path, &salt).await.map_err(classify_io)?;
                debug!(path = %salt_path.display(), "Created store salt");
                Ok(salt)
            }
        }
    }

    fn record_dir(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(CERTS_DIR).join(id))
    }

    async fn read_record(&self, id: &str) -> Result<Option<Certificate>> {
        let dir = self.record_dir(id)?;

        let meta_bytes = match FsUtils::read_optional(dir.join(META_FILE)).await.map_err(classify_io)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let metadata: CertificateMetadata = serde_json::from_slice(&meta_bytes)
            .map_err(|e| Error::StoreCorrupted(format!("Unreadable metadata for {}: {}", id, e)))?;
        if metadata.id != id {
            return Err(Error::StoreCorrupted(format!(
                "Metadata in {} belongs to {}",
                id, metadata.id
            )));
        }

        let certificate_pem = self.read_required_text(&dir, CERT_FILE, id).await?;
        let chain_pem = match FsUtils::read_optional(dir.join(CHAIN_FILE)).await.map_err(classify_io)? {
            Some(bytes) => Some(String::from_utf8(bytes).map_err(|_| {
                Error::StoreCorrupted(format!("Chain for {} is not UTF-8", id))
            })?),
            None => None,
        };

        let blob = FsUtils::read_optional(dir.join(KEY_FILE))
            .await
            .map_err(classify_io)?
            .ok_or_else(|| Error::StoreCorrupted(format!("Key material missing for {}", id)))?;
        let key_bytes = self
            .cipher
            .decrypt(&blob, id.as_bytes())
            .map_err(|e| Error::StoreCorrupted(format!("Cannot decrypt key for {}: {}", id, e)))?;
        let private_key_pem = String::from_utf8(key_bytes)
            .map_err(|_| Error::StoreCorrupted(format!("Key for {} is not UTF-8", id)))?;

        Ok(Some(metadata.into_certificate(certificate_pem, chain_pem, private_key_pem)))
    }

    async fn read_required_text(&self, dir: &Path, file: &str, id: &str) -> Result<String> {
        let bytes = FsUtils::read_optional(dir.join(file))
            .await
            .map_err(classify_io)?
            .ok_or_else(|| Error::StoreCorrupted(format!("{} missing for {}", file, id)))?;
        String::from_utf8(bytes).map_err(|_| Error::StoreCorrupted(format!("{} for {} is not UTF-8", file, id)))
    }
}

#[async_trait]
impl CertificateStore for LocalEncryptedStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, certificate: &Certificate) -> Result<Certificate> {
        certificate.validate()?;
        let dir = self.record_dir(&certificate.id)?;

        let blob = self
            .cipher
            .encrypt(certificate.private_key_pem.as_bytes(), certificate.id.as_bytes())?;
        FsUtils::write_atomic(dir.join(KEY_FILE), &blob).await.map_err(classify_io)?;
        FsUtils::write_atomic(dir.join(CERT_FILE), &certificate.certificate_pem)
            .await
            .map_err(classify_io)?;
        let chain_written = match &certificate.chain_pem {
            Some(chain) => FsUtils::write_atomic(dir.join(CHAIN_FILE), chain).await,
            None => FsUtils::remove_file(dir.join(CHAIN_FILE)).await,
        };
        chain_written.map_err(classify_io)?;

        let metadata = serde_json::to_vec_pretty(&CertificateMetadata::from(certificate))?;
        FsUtils::write_atomic(dir.join(META_FILE), metadata).await.map_err(classify_io)?;

        debug!(id = %certificate.id, state = %certificate.state, "Persisted certificate");
        Ok(certificate.clone())
    }

    async fn get(&self, id: &str) -> Result<Certificate> {
        self.read_record(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Certificate {}", id)))
    }

    async fn list(&self, filter: &CertificateFilter) -> Result<Vec<Certificate>> {
        let now = Utc::now();
        let dirs = FsUtils::list_subdirs(self.root.join(CERTS_DIR)).await.map_err(classify_io)?;

        let mut certificates = Vec::new();
        for dir in dirs {
            let id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(id) if validate_id(id).is_ok() => id.to_string(),
                _ => continue,
            };
            if let Some(certificate) = self.read_record(&id).await? {
                if filter.matches(&certificate, now) {
                    certificates.push(certificate);
                }
            }
        }

        Ok(certificates)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let dir = self.record_dir(id)?;
        if FsUtils::read_optional(dir.join(META_FILE)).await.map_err(classify_io)?.is_none() {
            return Err(Error::NotFound(format!("Certificate {}", id)));
        }

        // Drop the commit marker first so a partial delete reads as absent
        FsUtils::remove_file(dir.join(META_FILE)).await.map_err(classify_io)?;
        FsUtils::remove_dir_all(&dir).await.map_err(classify_io)?;
        debug!(id = %id, "Deleted certificate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::certificate;

    const ITERATIONS: u32 = 1_000;

    async fn open(dir: &Path) -> LocalEncryptedStore {
        LocalEncryptedStore::open_with_secret(dir, b"test-master-secret", ITERATIONS)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_preserves_pem() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let cert = certificate("web", &["example.com", "www.example.com"], 60);

        store.put(&cert).await.unwrap();
        let loaded = store.get("web").await.unwrap();

        assert_eq!(loaded.certificate_pem, cert.certificate_pem);
        assert_eq!(loaded.chain_pem, cert.chain_pem);
        assert_eq!(loaded.private_key_pem, cert.private_key_pem);
        assert_eq!(loaded.domains, cert.domains);
        assert_eq!(loaded.expires_at, cert.expires_at);
    }

    #[tokio::test]
    async fn test_key_is_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let cert = certificate("web", &["example.com"], 60);
        store.put(&cert).await.unwrap();

        let record = dir.path().join("certs/web");
        let blob = std::fs::read(record.join("key.enc")).unwrap();
        assert!(!blob.windows(b"key-of-web".len()).any(|w| w == b"key-of-web"));

        let meta = std::fs::read_to_string(record.join("meta.json")).unwrap();
        assert!(!meta.contains("PRIVATE KEY"));
        assert!(!meta.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn test_reopen_with_same_secret() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).await.put(&certificate("web", &["example.com"], 60)).await.unwrap();

        let reopened = open(dir.path()).await;
        assert_eq!(reopened.get("web").await.unwrap().id, "web");
    }

    #[tokio::test]
    async fn test_wrong_secret_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path()).await.put(&certificate("web", &["example.com"], 60)).await.unwrap();

        let other = LocalEncryptedStore::open_with_secret(dir.path(), b"another-secret", ITERATIONS)
            .await
            .unwrap();
        assert!(matches!(other.get("web").await, Err(Error::StoreCorrupted(_))));
    }

    #[tokio::test]
    async fn test_moved_key_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.put(&certificate("a", &["a.example.com"], 60)).await.unwrap();
        store.put(&certificate("b", &["b.example.com"], 60)).await.unwrap();

        let certs = dir.path().join("certs");
        std::fs::copy(certs.join("a/key.enc"), certs.join("b/key.enc")).unwrap();
        assert!(matches!(store.get("b").await, Err(Error::StoreCorrupted(_))));
    }

    #[tokio::test]
    async fn test_unparsable_metadata_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.put(&certificate("web", &["example.com"], 60)).await.unwrap();

        std::fs::write(dir.path().join("certs/web/meta.json"), b"{not json").unwrap();
        assert!(matches!(store.get("web").await, Err(Error::StoreCorrupted(_))));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.put(&certificate("b", &["b.example.com"], 10)).await.unwrap();
        store.put(&certificate("a", &["a.example.com"], 80)).await.unwrap();

        let all = store.list(&CertificateFilter::all()).await.unwrap();
        assert_eq!(all.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        let due = store
            .list(&CertificateFilter::renewal_candidates(chrono::Duration::days(30)))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "b");

        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a").await, Err(Error::NotFound(_))));
        assert!(matches!(store.delete("a").await, Err(Error::NotFound(_))));
        assert_eq!(store.list(&CertificateFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_creates_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("keys/master.key");

        let store = LocalEncryptedStore::open(dir.path().join("store"), &key_file, ITERATIONS)
            .await
            .unwrap();
        store.put(&certificate("web", &["example.com"], 60)).await.unwrap();
        assert!(key_file.exists());

        let reopened = LocalEncryptedStore::open(dir.path().join("store"), &key_file, ITERATIONS)
            .await
            .unwrap();
        assert!(reopened.get("web").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        assert!(matches!(store.get("../salt").await, Err(Error::InvalidRequest(_))));
    }
}
