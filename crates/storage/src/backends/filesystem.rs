//! Local filesystem storage backend.
//!
//! Objects are plain files under the root. Content type and user metadata live in
//! a sidecar JSON document under `.meta/`, which is hidden from listings. The
//! version token of an object is the SHA-256 of its content, so a conditional
//! write succeeds exactly when the caller saw the current bytes.
//!
//! Conditional writes hold an OS advisory lock on `.meta/<key>.lock` for the
//! check-and-rename, so overlapping writers in separate processes serialize too.
//! A per-key mutex keeps tasks of one process off the blocking pool meanwhile.

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ByteStream, ObjectAttributes, ObjectMeta, ObjectStore, ObjectVersion, PutCondition,
    StreamingUpload, VersionedObject,
};
use async_trait::async_trait;
use bottlesync_core::ContentHash;
use bytes::Bytes;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Directory holding sidecar metadata, relative to the root.
const META_DIR: &str = ".meta";

/// Marker in temp file names. Files containing it are never listed.
const TEMP_MARKER: &str = ".tmp.";

/// Per-path locks for conditional writes, shared by every backend in the process.
static CONDITIONAL_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn conditional_lock(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = CONDITIONAL_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// Canonicalization touches the filesystem, so it runs on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key == META_DIR || key.starts_with(&format!("{META_DIR}/")) {
            return Err(StorageError::InvalidKey(format!("reserved prefix: {key}")));
        }
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Sidecar path for a key that already passed validation.
    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.lock"))
    }

    /// Block until this process holds the exclusive advisory lock at `path`.
    /// The lock is released when the returned file is dropped.
    async fn lock_exclusive(path: PathBuf) -> StorageResult<std::fs::File> {
        tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))?
        .map_err(StorageError::Io)
    }

    /// Returns an error if the key would escape the storage root, including via
    /// symlinks anywhere along the path.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }

        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // New path: the nearest existing ancestor must resolve inside the root,
        // otherwise create_dir_all would follow a symlinked directory out of it.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;
                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    async fn ensure_parent(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// A unique sibling path for staging writes to `path`.
    fn temp_path_for(path: &Path) -> PathBuf {
        let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        )
    }

    /// Write to a temp file, fsync, then rename over `path`.
    async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        Self::ensure_parent(path).await?;
        let temp_path = Self::temp_path_for(path);
        let result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, path).await
        }
        .await;
        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result.map_err(StorageError::Io)
    }

    async fn write_sidecar(&self, key: &str, attributes: &ObjectAttributes) -> StorageResult<()> {
        let sidecar_path = self.sidecar_path(key);
        if attributes.content_type.is_none() && attributes.metadata.is_empty() {
            return Self::remove_if_present(&sidecar_path).await;
        }
        let sidecar = Sidecar {
            content_type: attributes.content_type.clone(),
            metadata: attributes.metadata.clone(),
        };
        let json = serde_json::to_vec(&sidecar).map_err(|e| StorageError::Metadata {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::write_atomic(&sidecar_path, &json).await
    }

    async fn read_sidecar(&self, key: &str) -> StorageResult<Sidecar> {
        match fs::read(self.sidecar_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| StorageError::Metadata {
                key: key.to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn remove_if_present(path: &Path) -> StorageResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Content version of the file at `path`, or None if it does not exist.
    async fn current_version(path: &Path) -> StorageResult<Option<ObjectVersion>> {
        let mut file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let mut hasher = ContentHash::hasher();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(ObjectVersion::new(hasher.finalize().to_hex())))
    }

    fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))?;
        let sidecar = self.read_sidecar(key).await?;
        let version = Self::current_version(&path).await?;

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: sidecar.content_type,
            version,
            metadata: sidecar.metadata,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_versioned(&self, key: &str) -> StorageResult<VersionedObject> {
        let data = self.get(key).await?;
        let version = ObjectVersion::new(ContentHash::compute(&data).to_hex());
        Ok(VersionedObject { data, version })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        Self::write_atomic(&path, &data).await?;
        self.write_sidecar(key, &ObjectAttributes::default()).await
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_conditional(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> StorageResult<ObjectVersion> {
        let path = self.key_path(key).await?;
        let lock = conditional_lock(&path);
        let _guard = lock.lock().await;
        let _file_lock = Self::lock_exclusive(self.lock_path(key)).await?;

        let current = Self::current_version(&path).await?;
        let satisfied = match (&condition, &current) {
            (PutCondition::IfAbsent, None) => true,
            (PutCondition::IfMatch(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if !satisfied {
            tracing::debug!(key = %key, ?condition, current = ?current, "conditional write rejected");
            return Err(StorageError::PreconditionFailed(key.to_string()));
        }

        Self::write_atomic(&path, &data).await?;
        self.write_sidecar(key, &ObjectAttributes::default()).await?;
        Ok(ObjectVersion::new(ContentHash::compute(&data).to_hex()))
    }

    #[instrument(skip(self, attributes), fields(backend = "filesystem"))]
    async fn put_stream(
        &self,
        key: &str,
        attributes: ObjectAttributes,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        Self::ensure_parent(&path).await?;

        let temp_path = Self::temp_path_for(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            temp_path: Some(temp_path),
            final_path: path,
            sidecar_path: self.sidecar_path(key),
            attributes,
            bytes_written: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| Self::not_found_or_io(key, e))?;
        Self::remove_if_present(&self.sidecar_path(key)).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // A prefix need not be a directory ("2025-07" matches "2025-07-21/..."),
        // so walk from the deepest directory component and filter by string prefix.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base_path = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.key_path(dir_part).await?
        };

        let mut results = Vec::new();
        match fs::try_exists(&base_path).await {
            Ok(false) => return Ok(results),
            Ok(true) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let meta_root = self.root.join(META_DIR);
        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // file_type() does not follow symlinks, so links are never walked.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != meta_root {
                        stack.push(path);
                    }
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let data = self.get(from).await?;
        let sidecar = self.read_sidecar(from).await?;
        let to_path = self.key_path(to).await?;
        Self::write_atomic(&to_path, &data).await?;
        self.write_sidecar(
            to,
            &ObjectAttributes {
                content_type: sidecar.content_type,
                metadata: sidecar.metadata,
            },
        )
        .await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
///
/// Dropping an unfinished upload removes its temp file.
struct FilesystemUpload {
    file: Option<fs::File>,
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    sidecar_path: PathBuf,
    attributes: ObjectAttributes,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("upload already finished"))
        })?;
        file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let file = self.file.take().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("upload already finished"))
        })?;
        file.sync_all().await?;
        drop(file);

        if self.attributes.content_type.is_some() || !self.attributes.metadata.is_empty() {
            let sidecar = Sidecar {
                content_type: self.attributes.content_type.clone(),
                metadata: self.attributes.metadata.clone(),
            };
            let json = serde_json::to_vec(&sidecar).map_err(|e| StorageError::Metadata {
                key: self.final_path.display().to_string(),
                message: e.to_string(),
            })?;
            FilesystemBackend::write_atomic(&self.sidecar_path, &json).await?;
        } else {
            FilesystemBackend::remove_if_present(&self.sidecar_path).await?;
        }

        if let Some(temp_path) = self.temp_path.take() {
            fs::rename(&temp_path, &self.final_path).await?;
        }
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        drop(self.file.take());
        if let Some(temp_path) = self.temp_path.take() {
            FilesystemBackend::remove_if_present(&temp_path).await?;
        }
        Ok(())
    }
}

impl Drop for FilesystemUpload {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            let _ = std::fs::remove_file(temp_path);
        }
    }
}
