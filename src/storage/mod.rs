//! Persistence: relational store (SQLite via sqlx) and blob store.
//!
//! # SQLite write pattern
//!
//! Stage handlers write through [`batches::BatchStore`] with direct pool
//! writes, one transaction per stage transition. Every transition checks
//! the expected prior state inside its transaction and no-ops when the
//! state already advanced, which is what makes at-least-once job delivery
//! safe without distributed locks.

use async_trait::async_trait;

pub mod batches;
pub mod db;
pub mod fs;
pub mod settings;

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON column (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested batch does not exist.
    #[error("batch not found: {0}")]
    BatchNotFound(uuid::Uuid),

    /// The requested item does not exist.
    #[error("item not found: {0}")]
    ItemNotFound(uuid::Uuid),

    /// A persisted row failed to map back into domain types.
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Errors from the blob store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No blob under that key.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The key is not acceptable (path escape, empty, ...).
    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    /// Underlying I/O failure.
    #[error("blob I/O error: {0}")]
    Io(String),
}

/// Object storage the pipeline reads originals from and writes parts to.
///
/// Keys use `/` as separator; the pipeline owns the
/// `smart-upload/{session}/` and `smart-upload/{session}/parts/` prefixes.
/// Implementations hold no per-call session state.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key, overwriting any previous blob.
    async fn upload(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Fetch a blob fully into memory.
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
