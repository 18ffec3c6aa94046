//! Object store access.
//!
//! Workers pull raw audio blobs from S3 by object key. The trait keeps the
//! worker testable; [`MemoryBlobStore`] serves byte buffers in-process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EngineError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EngineError::BlobStore(format!("get {key}: {e}")))?;

        let data = object
            .body
            .collect()
            .await
            .map_err(|e| EngineError::BlobStore(format!("read {key}: {e}")))?;
        Ok(data.into_bytes().to_vec())
    }
}

/// In-process blob store for tests and local runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .expect("blob store lock poisoned")
            .insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .expect("blob store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::BlobStore(format!("no such object: {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryBlobStore::new();
        store.put("abc.mp3", vec![1, 2, 3]);
        assert_eq!(store.fetch("abc.mp3").await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            store.fetch("missing.mp3").await.unwrap_err(),
            EngineError::BlobStore(_)
        ));
    }
}
