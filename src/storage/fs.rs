//! Filesystem blob store.
//!
//! Keys map to paths under a root directory, `/` separators preserved.
//! Suitable for single-node deployments; the S3-style store the hosted
//! deployment uses sits behind the same [`BlobStore`] trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::trace;

use super::{BlobStore, StorageError};

/// Blob store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root` (created on first upload).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a key to a path, rejecting escapes.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        if Path::new(key)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        trace!(key, size = bytes.len(), "blob uploaded");
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_owned()))
            }
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                trace!(key, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_upload_download_delete_round_trip() {
        let (_dir, store) = store();
        let key = "smart-upload/s1/parts/flute.pdf";

        store
            .upload(key, b"%PDF-data", "application/pdf")
            .await
            .expect("upload");
        let bytes = store.download(key).await.expect("download");
        assert_eq!(bytes, b"%PDF-data");

        store.delete(key).await.expect("delete");
        assert!(matches!(
            store.download(key).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_key_is_not_an_error() {
        let (_dir, store) = store();
        store.delete("smart-upload/none.pdf").await.expect("delete");
    }

    #[tokio::test]
    async fn test_path_escapes_are_rejected() {
        let (_dir, store) = store();
        for key in ["../outside.pdf", "/abs.pdf", "a/../../b.pdf", ""] {
            assert!(
                matches!(
                    store.upload(key, b"x", "application/pdf").await,
                    Err(StorageError::InvalidKey(_))
                ),
                "key {key:?} should be rejected"
            );
        }
    }
}
