use crate::RestError;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(thiserror::Error, Debug)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),
    #[error("object store request failed: {0}")]
    Rest(#[from] RestError),
}

/// Durable blob storage addressed by key inside a single bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Creates or overwrites the object at `key`.
    async fn put(&self, key: &str, data: Bytes, content_type: &str)
    -> Result<(), ObjectStoreError>;

    /// Returns `ObjectStoreError::NotFound` when there is no such object.
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Location of `key` as understood by the warehouse loader.
    fn uri(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket(), key)
    }
}
