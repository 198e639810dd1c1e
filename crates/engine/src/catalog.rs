//! Catalog retrieval.
//!
//! The Homebrew formula index is a JSON array of formula objects. Each formula
//! names its stable version and, per platform tag, a bottle URL and digest:
//!
//! ```json
//! [{"name": "curl",
//!   "versions": {"stable": "8.2.1"},
//!   "bottle": {"stable": {"files": {"arm64_sonoma": {"url": "...", "sha256": "..."}}}}}]
//! ```

use crate::error::CatalogFetchError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bottlesync_core::config::CatalogConfig;
use bottlesync_core::{BottleKey, BottleRecord, ContentHash};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::instrument;

/// Source of the current catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Every bottle for the target platforms, in catalog order.
    async fn fetch(&self) -> Result<Vec<BottleRecord>, CatalogFetchError>;
}

/// Client for the Homebrew JSON formula index.
pub struct HomebrewCatalog {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    platforms: HashSet<String>,
    retry: RetryPolicy,
}

impl HomebrewCatalog {
    pub fn new(
        config: &CatalogConfig,
        target_platforms: &[String],
        retry: RetryPolicy,
    ) -> Result<Self, CatalogFetchError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .build()
            .map_err(|e| CatalogFetchError::Request {
                url: config.url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
            timeout: config.timeout(),
            platforms: target_platforms.iter().cloned().collect(),
            retry,
        })
    }

    async fn fetch_once(&self) -> Result<Value, CatalogFetchError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| CatalogFetchError::Request {
                url: self.url.clone(),
                message: if e.is_timeout() {
                    format!("timed out after {:?}", self.timeout)
                } else {
                    e.to_string()
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogFetchError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| CatalogFetchError::Decode(e.to_string()))
    }
}

fn is_retryable(err: &CatalogFetchError) -> bool {
    match err {
        CatalogFetchError::Request { .. } => true,
        CatalogFetchError::Status { status, .. } => {
            matches!(status, 408 | 429) || *status >= 500
        }
        CatalogFetchError::Decode(_) => false,
    }
}

#[async_trait]
impl CatalogSource for HomebrewCatalog {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch(&self) -> Result<Vec<BottleRecord>, CatalogFetchError> {
        let mut retry = 0;
        let document = loop {
            match self.fetch_once().await {
                Ok(document) => break document,
                Err(e) if is_retryable(&e) && retry < self.retry.retries() => {
                    let delay = self.retry.delay(retry);
                    tracing::warn!(error = %e, retry = retry + 1, delay_ms = delay.as_millis() as u64, "catalog fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let records = parse_catalog(&document, &self.platforms)?;
        tracing::info!(bottles = records.len(), "catalog fetched");
        Ok(records)
    }
}

/// Extract bottle records for `platforms` from a formula index document.
///
/// Formulas or bottles with missing or malformed fields are skipped.
pub fn parse_catalog(
    document: &Value,
    platforms: &HashSet<String>,
) -> Result<Vec<BottleRecord>, CatalogFetchError> {
    let formulas = document.as_array().ok_or_else(|| {
        CatalogFetchError::Decode("formula index must be a JSON array".to_string())
    })?;

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for formula in formulas {
        let Some(name) = formula.get("name").and_then(Value::as_str) else {
            skipped += 1;
            continue;
        };
        let Some(version) = formula
            .pointer("/versions/stable")
            .and_then(Value::as_str)
        else {
            tracing::debug!(formula = %name, "no stable version, skipping");
            skipped += 1;
            continue;
        };
        let Some(files) = formula
            .pointer("/bottle/stable/files")
            .and_then(Value::as_object)
        else {
            continue;
        };

        // serde_json maps are sorted, so platform order is stable.
        for (platform, file) in files {
            if !platforms.contains(platform) {
                continue;
            }
            match parse_bottle(name, version, platform, file) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    tracing::debug!(formula = %name, platform = %platform, reason = %reason, "malformed bottle, skipping");
                    skipped += 1;
                }
            }
        }
    }

    if skipped > 0 {
        tracing::debug!(skipped, "catalog entries skipped");
    }
    Ok(records)
}

fn parse_bottle(
    name: &str,
    version: &str,
    platform: &str,
    file: &Value,
) -> Result<BottleRecord, String> {
    let key = BottleKey::new(name, version, platform).map_err(|e| e.to_string())?;
    let url = file
        .get("url")
        .and_then(Value::as_str)
        .filter(|u| u.starts_with("https://") || u.starts_with("http://"))
        .ok_or("missing or non-http url")?;
    let sha256 = file
        .get("sha256")
        .and_then(Value::as_str)
        .ok_or("missing sha256")?;
    let sha256 = ContentHash::from_hex(sha256).map_err(|e| e.to_string())?;
    let size = file.get("size").and_then(Value::as_u64).filter(|s| *s > 0);
    Ok(BottleRecord::new(key, sha256, url, size))
}
