use async_trait::async_trait;
use bottlesync_core::BottleRecord;
use bottlesync_engine::{
    ArtifactFetcher, ArtifactStream, CatalogFetchError, CatalogSource, FetchError,
    NotificationSink, NotifyError, SyncEvent,
};
use bottlesync_storage::{
    ByteStream, MemoryBackend, ObjectAttributes, ObjectMeta, ObjectStore, ObjectVersion,
    PutCondition, StorageError, StorageResult, StreamingUpload, VersionedObject,
};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Catalog that returns fixed records, or fails.
pub struct StaticCatalog {
    records: Option<Vec<BottleRecord>>,
}

#[allow(dead_code)]
impl StaticCatalog {
    pub fn new(records: Vec<BottleRecord>) -> Self {
        Self {
            records: Some(records),
        }
    }

    pub fn unavailable() -> Self {
        Self { records: None }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn fetch(&self) -> Result<Vec<BottleRecord>, CatalogFetchError> {
        self.records.clone().ok_or(CatalogFetchError::Status {
            url: "https://formulae.test/api/formula.json".to_string(),
            status: 503,
        })
    }
}

/// One scripted response.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum Reply {
    /// Serve these bytes in two chunks.
    Body(Bytes),
    /// Wait, then serve the bytes.
    Delayed(Duration, Bytes),
    /// Fail with this HTTP status.
    Status(u16),
    /// Send headers, then never a byte.
    Hang,
}

/// Fetcher that replays per-URL scripts. The last reply of a script repeats.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<HashMap<String, u32>>,
}

#[allow(dead_code)]
impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: impl Into<String>, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.into(), replies.into_iter().collect());
    }

    pub fn serve(&self, url: impl Into<String>, body: Bytes) {
        self.script(url, [Reply::Body(body)]);
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(url)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

fn two_chunks(body: Bytes) -> ArtifactStream {
    let mid = body.len() / 2;
    let chunks: Vec<Result<Bytes, FetchError>> = vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))];
    Box::pin(futures::stream::iter(chunks))
}

#[async_trait]
impl ArtifactFetcher for ScriptedFetcher {
    async fn open(&self, url: &str) -> Result<ArtifactStream, FetchError> {
        match self.next_reply(url) {
            Some(Reply::Body(body)) => Ok(two_chunks(body)),
            Some(Reply::Delayed(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(two_chunks(body))
            }
            Some(Reply::Status(status)) => Err(FetchError::Status { status }),
            Some(Reply::Hang) => Ok(Box::pin(futures::stream::pending::<Result<Bytes, FetchError>>())),
            None => Err(FetchError::Status { status: 404 }),
        }
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn last_status(&self) -> Option<String> {
        self.events.lock().unwrap().last().map(|e| e.status.clone())
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, event: &SyncEvent) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Store where every conditional write loses the race.
#[derive(Clone, Default)]
pub struct ConflictingStore {
    inner: MemoryBackend,
}

#[allow(dead_code)]
impl ConflictingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for ConflictingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_versioned(&self, key: &str) -> StorageResult<VersionedObject> {
        self.inner.get_versioned(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        _data: Bytes,
        _condition: PutCondition,
    ) -> StorageResult<ObjectVersion> {
        Err(StorageError::PreconditionFailed(key.to_string()))
    }

    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        self.inner.put_stream(key, attributes).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await
    }

    fn backend_name(&self) -> &'static str {
        "conflicting"
    }
}

/// Store whose staged uploads accept data but never finish publishing.
#[derive(Default)]
pub struct StallingPublishStore {
    inner: MemoryBackend,
}

#[allow(dead_code)]
impl StallingPublishStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct StallingUpload {
    inner: Box<dyn StreamingUpload>,
}

#[async_trait]
impl StreamingUpload for StallingUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.inner.write(data).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        std::future::pending().await
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}

#[async_trait]
impl ObjectStore for StallingPublishStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_versioned(&self, key: &str) -> StorageResult<VersionedObject> {
        self.inner.get_versioned(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn put_conditional(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> StorageResult<ObjectVersion> {
        self.inner.put_conditional(key, data, condition).await
    }

    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let inner = self.inner.put_stream(key, attributes).await?;
        Ok(Box::new(StallingUpload { inner }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await
    }

    fn backend_name(&self) -> &'static str {
        "stalling"
    }
}
