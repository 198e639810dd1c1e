//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Homebrew formula index.
pub const DEFAULT_CATALOG_URL: &str = "https://formulae.brew.sh/api/formula.json";

/// Object key of the primary ledger document.
pub const DEFAULT_LEDGER_KEY: &str = "bottles_hash.json";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Object storage for artifacts and the ledger.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Catalog source.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Planning and run health policy.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Ledger persistence.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Download worker profiles.
    #[serde(default)]
    pub workers: WorkerProfiles,
    /// Per-item network retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Event delivery.
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Prometheus exposition.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Validate every section. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.catalog.validate()?;
        self.sync.validate()?;
        self.ledger.validate()?;
        self.workers.lightweight.validate("lightweight")?;
        self.workers.batch.validate("batch")?;
        self.retry.validate()?;
        self.notifications.validate()?;
        Ok(())
    }

    /// Configuration for tests: filesystem storage under `root`.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::Filesystem { path: root.into() },
            ..Self::default()
        }
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/mirror"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket name".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem storage path cannot be empty".to_string());
                }
                Ok(())
            }
        }
    }

    /// The same backend pointed at a different bucket.
    ///
    /// For S3 this keeps endpoint, region and credentials and drops the key
    /// prefix. For the filesystem backend a bucket is a sibling directory of the
    /// configured root.
    pub fn with_bucket(&self, bucket: &str) -> StorageConfig {
        match self {
            StorageConfig::S3 {
                endpoint,
                region,
                access_key_id,
                secret_access_key,
                force_path_style,
                ..
            } => StorageConfig::S3 {
                bucket: bucket.to_string(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: None,
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
            },
            StorageConfig::Filesystem { path } => {
                let parent = path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                StorageConfig::Filesystem {
                    path: parent.join(bucket),
                }
            }
        }
    }
}

/// Catalog source configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// URL of the formula index.
    #[serde(default = "default_catalog_url")]
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
    /// User-Agent header sent to the catalog and artifact hosts.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_catalog_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("bottlesync/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            timeout_secs: default_catalog_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl CatalogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        let lower = self.url.to_ascii_lowercase();
        if !lower.starts_with("https://") && !lower.starts_with("http://") {
            return Err(format!("catalog url must be http(s): {}", self.url));
        }
        if self.timeout_secs == 0 {
            return Err("catalog timeout_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// How to estimate the size of a candidate whose catalog entry has none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SizeFallback {
    /// Mean size of ledger entries for the same platform, then the global mean.
    #[default]
    PlatformMean,
    /// Mean size across every ledger entry.
    GlobalMean,
    /// A fixed number of bytes.
    Fixed { bytes: u64 },
}

/// Supplementary ledger loaded before planning. At most one per run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalHashSource {
    #[default]
    None,
    /// A key in the primary object store.
    ObjectKey { key: String },
    /// A key in another bucket of the same storage service.
    BucketKey { bucket: String, key: String },
    /// A document served over HTTPS.
    HttpsUrl { url: String },
}

impl ExternalHashSource {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::None => Ok(()),
            Self::ObjectKey { key } => validate_external_key(key),
            Self::BucketKey { bucket, key } => {
                if bucket.trim().is_empty() {
                    return Err("external hash source bucket cannot be empty".to_string());
                }
                validate_external_key(key)
            }
            Self::HttpsUrl { url } => {
                if !url.to_ascii_lowercase().starts_with("https://") {
                    return Err(format!("external hash source must use https: {url}"));
                }
                Ok(())
            }
        }
    }
}

fn validate_external_key(key: &str) -> Result<(), String> {
    if key.trim().is_empty() {
        return Err("external hash source key cannot be empty".to_string());
    }
    if !key.ends_with(".json") {
        return Err(format!("external hash source key must end with .json: {key}"));
    }
    Ok(())
}

/// Planning and run health policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Platform tags to mirror (e.g. `arm64_sonoma`).
    #[serde(default = "default_target_platforms")]
    pub target_platforms: Vec<String>,
    /// Estimated payloads at or above this size use the batch worker.
    #[serde(default = "default_size_threshold_bytes")]
    pub size_threshold_bytes: u64,
    /// Highest failure rate (0.0-1.0) still reported as PARTIAL_SUCCESS.
    #[serde(default = "default_partial_failure_threshold")]
    pub partial_failure_threshold: f64,
    /// Size estimate for candidates without a catalog size.
    #[serde(default)]
    pub size_fallback: SizeFallback,
    /// Optional supplementary ledger.
    #[serde(default)]
    pub external_hash_source: ExternalHashSource,
}

fn default_target_platforms() -> Vec<String> {
    vec![
        "arm64_sonoma".to_string(),
        "arm64_ventura".to_string(),
        "monterey".to_string(),
    ]
}

fn default_size_threshold_bytes() -> u64 {
    20_000_000_000
}

fn default_partial_failure_threshold() -> f64 {
    0.10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_platforms: default_target_platforms(),
            size_threshold_bytes: default_size_threshold_bytes(),
            partial_failure_threshold: default_partial_failure_threshold(),
            size_fallback: SizeFallback::default(),
            external_hash_source: ExternalHashSource::default(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.target_platforms.is_empty() {
            return Err("at least one target platform is required".to_string());
        }
        for platform in &self.target_platforms {
            if platform.is_empty()
                || !platform
                    .chars()
                    .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
            {
                return Err(format!("invalid platform tag: {platform:?}"));
            }
        }
        if self.size_threshold_bytes == 0 {
            return Err("size_threshold_bytes must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.partial_failure_threshold) {
            return Err(format!(
                "partial_failure_threshold must be between 0.0 and 1.0, got {}",
                self.partial_failure_threshold
            ));
        }
        self.external_hash_source.validate()
    }
}

/// Ledger persistence configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Object key of the ledger document.
    #[serde(default = "default_ledger_key")]
    pub key: String,
    /// Prefix for ledger backups.
    #[serde(default = "default_backup_prefix")]
    pub backup_prefix: String,
    /// Conditional-write attempts before a commit is abandoned.
    #[serde(default = "default_commit_attempts")]
    pub commit_attempts: u32,
    /// Base delay between commit attempts, in milliseconds.
    #[serde(default = "default_commit_backoff_ms")]
    pub commit_backoff_ms: u64,
    /// Commit pending uploads every N successes instead of only at run end.
    #[serde(default)]
    pub checkpoint_every: Option<usize>,
    /// Copy the previous document to the backup prefix before each commit.
    #[serde(default)]
    pub backup_on_commit: bool,
    /// Rebuild from artifact metadata when the primary document is corrupt.
    #[serde(default)]
    pub rebuild_on_corruption: bool,
}

fn default_ledger_key() -> String {
    DEFAULT_LEDGER_KEY.to_string()
}

fn default_backup_prefix() -> String {
    "backups".to_string()
}

fn default_commit_attempts() -> u32 {
    5
}

fn default_commit_backoff_ms() -> u64 {
    200
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            key: default_ledger_key(),
            backup_prefix: default_backup_prefix(),
            commit_attempts: default_commit_attempts(),
            commit_backoff_ms: default_commit_backoff_ms(),
            checkpoint_every: None,
            backup_on_commit: false,
            rebuild_on_corruption: false,
        }
    }
}

impl LedgerConfig {
    pub fn commit_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.key.ends_with(".json") {
            return Err(format!("ledger key must end with .json: {}", self.key));
        }
        if self.commit_attempts == 0 {
            return Err("ledger commit_attempts must be at least 1".to_string());
        }
        if self.checkpoint_every == Some(0) {
            return Err("ledger checkpoint_every must be at least 1 when set".to_string());
        }
        Ok(())
    }
}

/// Longest timeout, deadline or interval a worker profile accepts (one week).
pub const MAX_WORKER_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Resource ceilings for one worker class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Maximum items in flight.
    pub max_concurrency: usize,
    /// Timeout for a single fetch attempt, in seconds.
    pub per_item_timeout_secs: u64,
    /// Wall-clock budget for the whole run, in seconds.
    pub run_deadline_secs: u64,
    /// Time in-flight items get to finish once admission stops, in seconds.
    pub drain_grace_secs: u64,
    /// Interval between progress snapshots, in seconds.
    pub progress_interval_secs: u64,
}

impl WorkerProfile {
    /// Sized for short-lived function runtimes (15 minute ceiling).
    pub fn lightweight() -> Self {
        Self {
            max_concurrency: 4,
            per_item_timeout_secs: 300,
            run_deadline_secs: 14 * 60,
            drain_grace_secs: 30,
            progress_interval_secs: 60,
        }
    }

    /// Sized for long-running container tasks.
    pub fn batch() -> Self {
        Self {
            max_concurrency: 10,
            per_item_timeout_secs: 30 * 60,
            run_deadline_secs: 6 * 60 * 60,
            drain_grace_secs: 120,
            progress_interval_secs: 300,
        }
    }

    pub fn per_item_timeout(&self) -> Duration {
        Duration::from_secs(self.per_item_timeout_secs)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err(format!("workers.{name}.max_concurrency must be at least 1"));
        }
        if self.per_item_timeout_secs == 0 {
            return Err(format!("workers.{name}.per_item_timeout_secs must be positive"));
        }
        if self.progress_interval_secs == 0 {
            return Err(format!("workers.{name}.progress_interval_secs must be positive"));
        }
        for (field, secs) in [
            ("per_item_timeout_secs", self.per_item_timeout_secs),
            ("run_deadline_secs", self.run_deadline_secs),
            ("progress_interval_secs", self.progress_interval_secs),
        ] {
            if secs > MAX_WORKER_DURATION_SECS {
                return Err(format!(
                    "workers.{name}.{field} must be at most {MAX_WORKER_DURATION_SECS} (one week), got {secs}"
                ));
            }
        }
        if self.drain_grace_secs >= self.run_deadline_secs {
            return Err(format!(
                "workers.{name}.drain_grace_secs must be shorter than run_deadline_secs"
            ));
        }
        Ok(())
    }
}

/// The two worker profiles selected by the router.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerProfiles {
    #[serde(default = "WorkerProfile::lightweight")]
    pub lightweight: WorkerProfile,
    #[serde(default = "WorkerProfile::batch")]
    pub batch: WorkerProfile,
}

impl Default for WorkerProfiles {
    fn default() -> Self {
        Self {
            lightweight: WorkerProfile::lightweight(),
            batch: WorkerProfile::batch(),
        }
    }
}

/// Exponential backoff for network failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction (0.1 = ±10%).
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            jitter: default_retry_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("retry jitter must be between 0.0 and 1.0, got {}", self.jitter));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("retry max_delay_ms must not be smaller than base_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Event delivery configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// HTTPS endpoint receiving JSON events.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Per-event delivery timeout in seconds.
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notification_timeout_secs() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(url) = &self.webhook_url
            && !url.to_ascii_lowercase().starts_with("https://")
        {
            return Err(format!("notification webhook must use https: {url}"));
        }
        Ok(())
    }
}

/// Prometheus exposition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Write the text exposition here after each run (node_exporter textfile collector).
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
}
