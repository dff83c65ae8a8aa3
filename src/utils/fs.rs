use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::Error;

/// Permission bits for private directories
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;
/// Permission bits for private files
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// File system utilities for owner-only storage
pub struct FsUtils;

impl FsUtils {
    /// Ensure a directory exists and is accessible only by its owner
    pub async fn ensure_private_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        let path = path.as_ref();

        fs::create_dir_all(path).await.map_err(Error::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE))
                .await
                .map_err(Error::Io)?;
        }

        Ok(())
    }

    /// Write a file atomically with owner-only permissions.
    ///
    /// The contents go to a temporary sibling which is synced and renamed
    /// over the target, so readers see either the old or the new file.
    pub async fn write_atomic<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<(), Error> {
        let path = path.as_ref();
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidRequest(format!("Path has no parent: {:?}", path)))?;
        Self::ensure_private_dir(parent).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidRequest(format!("Invalid file name: {:?}", path)))?;
        let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(FILE_MODE);

        let result = async {
            let mut file = options.open(&tmp_path).await?;
            file.write_all(contents.as_ref()).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Io(e));
        }

        Ok(())
    }

    /// Read a file, `None` when it does not exist
    pub async fn read_optional<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(path.as_ref()).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read file as a string
    pub async fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String, Error> {
        let path = path.as_ref();

        fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("File not found: {:?}", path))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Delete a file if it exists
    pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        match fs::remove_file(path.as_ref()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    /// Delete a directory and all its contents if it exists
    pub async fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<(), Error> {
        match fs::remove_dir_all(path.as_ref()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    /// List subdirectories of a directory; empty when it does not exist
    pub async fn list_subdirs<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>, Error> {
        let mut entries = match fs::read_dir(path.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
            if entry.file_type().await.map_err(Error::Io)?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();

        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/meta.json");

        FsUtils::write_atomic(&path, b"one").await.unwrap();
        FsUtils::write_atomic(&path, b"two").await.unwrap();

        assert_eq!(FsUtils::read_to_string(&path).await.unwrap(), "two");
        // No temporary files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private/key.enc");
        FsUtils::write_atomic(&path, b"secret").await.unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        let dir_mode = std::fs::metadata(dir.path().join("private")).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsUtils::read_optional(dir.path().join("nope")).await.unwrap().is_none());
        assert!(FsUtils::list_subdirs(dir.path().join("nope")).await.unwrap().is_empty());
        assert!(FsUtils::remove_dir_all(dir.path().join("nope")).await.is_ok());
        assert!(matches!(
            FsUtils::read_to_string(dir.path().join("nope")).await,
            Err(Error::NotFound(_))
        ));
    }
}
