//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Opaque version token of a stored object (an ETag on S3).
///
/// Two reads returning the same token observed the same content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectVersion({})", self.0)
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition for a conditional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutCondition {
    /// Succeed only if no object exists at the key.
    IfAbsent,
    /// Succeed only if the current object has this version.
    IfMatch(ObjectVersion),
}

/// Attributes attached to an object at write time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    /// User metadata (S3 `x-amz-meta-*`). Keys are lowercase.
    pub metadata: BTreeMap<String, String>,
}

impl ObjectAttributes {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug, Default)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
    /// Version token (if the backend provides one).
    pub version: Option<ObjectVersion>,
    /// User metadata attached at write time.
    pub metadata: BTreeMap<String, String>,
}

/// Object content together with the version it was read at.
#[derive(Clone, Debug)]
pub struct VersionedObject {
    pub data: Bytes,
    pub version: ObjectVersion,
}

/// Key-addressed object store with read-after-write consistency.
///
/// Used both for bottle artifacts and for the ledger document. The ledger relies
/// on [`ObjectStore::put_conditional`] for optimistic concurrency.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object's content and the version it was read at.
    async fn get_versioned(&self, key: &str) -> StorageResult<VersionedObject>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put an object atomically. Readers see the old or the new content, never a mix.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Put an object atomically if `condition` holds, returning the new version.
    ///
    /// Returns [`StorageError::PreconditionFailed`](crate::StorageError::PreconditionFailed)
    /// when another writer got there first.
    async fn put_conditional(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> StorageResult<ObjectVersion>;

    /// Start a streaming upload. Nothing is visible at `key` until `finish`.
    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Copy an object.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Get the name of this storage backend ("s3", "filesystem", ...).
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Publish the object and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
