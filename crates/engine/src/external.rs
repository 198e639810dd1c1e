//! Supplementary hash ledgers.
//!
//! An operator may point a run at one extra ledger document, typically the
//! ledger of another mirror, whose entries are merged before planning. A
//! source that cannot be read never stops the run.

use crate::error::ExternalSourceError;
use bottlesync_core::config::{ExternalHashSource, StorageConfig};
use bottlesync_core::{HashLedger, ParsedLedger};
use bottlesync_storage::ObjectStore;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use time::{Date, OffsetDateTime};
use tracing::instrument;

const EXTERNAL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest external ledger accepted (64 MiB, several times Homebrew's full catalog).
pub const MAX_EXTERNAL_DOCUMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Loads the configured [`ExternalHashSource`].
pub struct ExternalSourceLoader {
    store: Arc<dyn ObjectStore>,
    storage: StorageConfig,
    client: reqwest::Client,
    max_document_bytes: u64,
}

impl ExternalSourceLoader {
    pub fn new(store: Arc<dyn ObjectStore>, storage: StorageConfig, client: reqwest::Client) -> Self {
        Self {
            store,
            storage,
            client,
            max_document_bytes: MAX_EXTERNAL_DOCUMENT_BYTES,
        }
    }

    pub fn with_max_document_bytes(mut self, limit: u64) -> Self {
        self.max_document_bytes = limit;
        self
    }

    fn check_size(&self, size: u64) -> Result<(), ExternalSourceError> {
        if size > self.max_document_bytes {
            return Err(ExternalSourceError::TooLarge {
                size,
                limit: self.max_document_bytes,
            });
        }
        Ok(())
    }

    async fn read_object(&self, store: &dyn ObjectStore, key: &str) -> Result<Bytes, ExternalSourceError> {
        self.check_size(store.head(key).await?.size)?;
        let data = store.get(key).await?;
        self.check_size(data.len() as u64)?;
        Ok(data)
    }

    /// Read and validate the source. `Ok(None)` when no source is configured.
    ///
    /// Entries are validated exactly like the primary ledger's; invalid ones
    /// are dropped rather than failing the whole document.
    #[instrument(skip(self, today, now))]
    pub async fn load(
        &self,
        source: &ExternalHashSource,
        today: Date,
        now: OffsetDateTime,
    ) -> Result<Option<ParsedLedger>, ExternalSourceError> {
        let data = match source {
            ExternalHashSource::None => return Ok(None),
            ExternalHashSource::ObjectKey { key } => self.read_object(self.store.as_ref(), key).await?,
            ExternalHashSource::BucketKey { bucket, key } => {
                let other = bottlesync_storage::from_config(&self.storage.with_bucket(bucket)).await?;
                self.read_object(other.as_ref(), key).await?
            }
            ExternalHashSource::HttpsUrl { url } => self.fetch_https(url).await?,
        };

        let parsed = HashLedger::parse(&data, today, now)?;
        tracing::info!(
            entries = parsed.ledger.len(),
            dropped = parsed.dropped.len(),
            "external hash source loaded"
        );
        Ok(Some(parsed))
    }

    async fn fetch_https(&self, url: &str) -> Result<Bytes, ExternalSourceError> {
        if !url.to_ascii_lowercase().starts_with("https://") {
            return Err(ExternalSourceError::InsecureUrl(url.to_string()));
        }
        let response = self
            .client
            .get(url)
            .timeout(EXTERNAL_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| ExternalSourceError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExternalSourceError::Status(status.as_u16()));
        }
        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        // Content-Length may be absent or wrong; enforce the limit while streaming.
        let mut body = response.bytes_stream();
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ExternalSourceError::Request(e.to_string()))?;
            self.check_size((data.len() + chunk.len()) as u64)?;
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }
}
