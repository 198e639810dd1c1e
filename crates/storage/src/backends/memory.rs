//! In-process storage backend.
//!
//! Keeps every object in a map behind a mutex. Useful for dry runs and tests;
//! nothing survives the process.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ObjectAttributes, ObjectMeta, ObjectStore, ObjectVersion, PutCondition,
    StreamingUpload, VersionedObject,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::instrument;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    version: ObjectVersion,
    attributes: ObjectAttributes,
    last_modified: time::OffsetDateTime,
}

#[derive(Default)]
struct Inner {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_version: AtomicU64,
}

impl Inner {
    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_version(&self) -> ObjectVersion {
        ObjectVersion::new(format!(
            "mem-{}",
            self.next_version.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    fn insert(&self, key: &str, data: Bytes, attributes: ObjectAttributes) -> ObjectVersion {
        let version = self.next_version();
        self.objects().insert(
            key.to_string(),
            StoredObject {
                data,
                version: version.clone(),
                attributes,
                last_modified: time::OffsetDateTime::now_utc(),
            },
        );
        version
    }
}

/// In-memory object store. Clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(key: &str) -> StorageError {
    StorageError::NotFound(key.to_string())
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.inner.objects().contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.inner.objects();
        let object = objects.get(key).ok_or_else(|| not_found(key))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            content_type: object.attributes.content_type.clone(),
            version: Some(object.version.clone()),
            metadata: object.attributes.metadata.clone(),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Ok(self.get_versioned(key).await?.data)
    }

    async fn get_versioned(&self, key: &str) -> StorageResult<VersionedObject> {
        let objects = self.inner.objects();
        let object = objects.get(key).ok_or_else(|| not_found(key))?;
        Ok(VersionedObject {
            data: object.data.clone(),
            version: object.version.clone(),
        })
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.get(key).await?;
        Ok(Box::pin(futures::stream::iter([Ok(data)])))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.insert(key, data, ObjectAttributes::default());
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put_conditional(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> StorageResult<ObjectVersion> {
        // Check and write under one lock so the condition cannot go stale.
        let mut objects = self.inner.objects();
        let satisfied = match (&condition, objects.get(key)) {
            (PutCondition::IfAbsent, None) => true,
            (PutCondition::IfMatch(expected), Some(current)) => *expected == current.version,
            _ => false,
        };
        if !satisfied {
            return Err(StorageError::PreconditionFailed(key.to_string()));
        }
        let version = self.inner.next_version();
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                version: version.clone(),
                attributes: ObjectAttributes::default(),
                last_modified: time::OffsetDateTime::now_utc(),
            },
        );
        Ok(version)
    }

    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        Ok(Box::new(MemoryUpload {
            inner: self.inner.clone(),
            key: key.to_string(),
            attributes,
            buffer: BytesMut::new(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner
            .objects()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .inner
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self
            .inner
            .objects()
            .get(from)
            .cloned()
            .ok_or_else(|| not_found(from))?;
        self.inner.insert(to, source.data, source.attributes);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryUpload {
    inner: Arc<Inner>,
    key: String,
    attributes: ObjectAttributes,
    buffer: BytesMut,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let MemoryUpload {
            inner,
            key,
            attributes,
            buffer,
        } = *self;
        let size = buffer.len() as u64;
        inner.insert(&key, buffer.freeze(), attributes);
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_change_on_every_write() {
        let store = MemoryBackend::new();
        store.put("k", Bytes::from("same")).await.unwrap();
        let first = store.get_versioned("k").await.unwrap().version;
        store.put("k", Bytes::from("same")).await.unwrap();
        let second = store.get_versioned("k").await.unwrap().version;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_conditional_write_races() {
        let store = MemoryBackend::new();
        let v1 = store
            .put_conditional("ledger", Bytes::from("a"), PutCondition::IfAbsent)
            .await
            .unwrap();

        let winner = store
            .put_conditional("ledger", Bytes::from("b"), PutCondition::IfMatch(v1.clone()))
            .await;
        let loser = store
            .put_conditional("ledger", Bytes::from("c"), PutCondition::IfMatch(v1))
            .await;

        assert!(winner.is_ok());
        assert!(loser.unwrap_err().is_precondition_failed());
        assert_eq!(store.get("ledger").await.unwrap(), Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_upload_visible_only_after_finish() {
        let store = MemoryBackend::new();
        let mut upload = store
            .put_stream("a", ObjectAttributes::default().with_metadata("sha256", "x"))
            .await
            .unwrap();
        upload.write(Bytes::from("12")).await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(upload.finish().await.unwrap(), 2);
        assert_eq!(
            store.head("a").await.unwrap().metadata.get("sha256").map(String::as_str),
            Some("x")
        );

        let mut upload = store
            .put_stream("b", ObjectAttributes::default())
            .await
            .unwrap();
        upload.write(Bytes::from("12")).await.unwrap();
        upload.abort().await.unwrap();
        assert!(!store.exists("b").await.unwrap());
    }
}
