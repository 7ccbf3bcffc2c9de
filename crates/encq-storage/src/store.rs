//! Blob store trait.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageResult;

/// Durable key/bytes storage. Multipart transfer for large objects is an
/// implementation detail of the backend, transparent to callers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key.
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Fetch an object's bytes. `NotFound` if the key is absent.
    async fn get_bytes(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Upload a local file under a key.
    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()>;

    /// Download an object to a local file, creating parent directories.
    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()>;

    /// Delete an object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix.
    async fn list_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;
}
