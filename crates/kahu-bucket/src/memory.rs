//! In-memory `BucketStore` used by engine tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::{BucketError, BucketStore, ObjectByteStream, ObjectMeta};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    last_modified: DateTime<Utc>,
    etag: String,
    version_id: String,
}

/// Map-backed store. `chunk_size` controls how the byte stream is sliced so
/// callers can exercise reads that split separator sequences across chunks.
pub struct MemoryBucketStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    chunk_size: usize,
}

impl MemoryBucketStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Insert an object with deterministic metadata derived from the contents.
    pub fn insert(&self, key: &str, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        let etag = format!("{:016x}", fnv64(&bytes));
        let version = self.objects.lock().expect("bucket lock poisoned").len() + 1;
        self.insert_with_meta(
            key,
            bytes,
            Utc.timestamp_opt(1_700_000_000 + version as i64, 0)
                .single()
                .expect("valid timestamp"),
            &etag,
            &format!("v{version:04}"),
        );
    }

    pub fn insert_with_meta(
        &self,
        key: &str,
        bytes: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
        etag: &str,
        version_id: &str,
    ) {
        let mut objects = self.objects.lock().expect("bucket lock poisoned");
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.into(),
                last_modified,
                etag: etag.to_string(),
                version_id: version_id.to_string(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .remove(key);
    }

    fn meta(key: &str, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: object.bytes.len() as i64,
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            version_id: Some(object.version_id.clone()),
            checksum: None,
        }
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BucketError> {
        let objects = self.objects.lock().expect("bucket lock poisoned");
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| Self::meta(key, object))
            .collect())
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, BucketError> {
        let objects = self.objects.lock().expect("bucket lock poisoned");
        objects
            .get(key)
            .map(|object| Self::meta(key, object))
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    async fn open_stream(&self, key: &str) -> Result<ObjectByteStream, BucketError> {
        let bytes = {
            let objects = self.objects.lock().expect("bucket lock poisoned");
            objects
                .get(key)
                .map(|object| object.bytes.clone())
                .ok_or_else(|| BucketError::NotFound(key.to_string()))?
        };

        let chunk_size = self.chunk_size;
        let chunks: Vec<Result<Bytes, BucketError>> = (0..bytes.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(bytes.len());
                Ok(bytes.slice(start..end))
            })
            .collect();

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

fn fnv64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn lists_only_matching_prefix() {
        let store = MemoryBucketStore::new(8);
        store.insert("incoming/a.csv", "one");
        store.insert("incoming/b.csv", "two");
        store.insert("archive/c.csv", "three");

        let metas = store.list("incoming/").await.expect("list");
        let keys: Vec<_> = metas.iter().map(|meta| meta.key.as_str()).collect();
        assert_eq!(keys, vec!["incoming/a.csv", "incoming/b.csv"]);
        assert!(metas.iter().all(|meta| meta.version_id.is_some()));
    }

    #[tokio::test]
    async fn streams_in_configured_chunks() {
        let store = MemoryBucketStore::new(4);
        store.insert("incoming/a.csv", "0123456789");

        let mut stream = store.open_stream("incoming/a.csv").await.expect("open");
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.expect("chunk"));
        }

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].as_ref(), b"0123");
        assert_eq!(chunks[2].as_ref(), b"89");
    }

    #[tokio::test]
    async fn head_reports_missing_object() {
        let store = MemoryBucketStore::new(8);
        let err = store.head("incoming/missing.csv").await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
        assert!(!store.exists("incoming/missing.csv").await.expect("exists"));
    }
}
