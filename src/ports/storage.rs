use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a whole object.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Store an object, overwriting any previous one under the same key.
    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Time-limited read URL for an object.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, body: Bytes) -> StorageResult<()> {
        (**self).put(key, body).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        (**self).presign_get(key, expires_in).await
    }
}
