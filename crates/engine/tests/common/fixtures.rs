use super::mocks::{RecordingSink, ScriptedFetcher, StaticCatalog};
use bottlesync_core::config::{AppConfig, RetryConfig, StorageConfig, WorkerProfile};
use bottlesync_core::{BottleKey, BottleRecord, ContentHash, LedgerEntry};
use bottlesync_engine::{Notifier, SyncEngine};
use bottlesync_storage::ObjectStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use time::macros::date;

/// Config tuned for fast, deterministic tests.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let profile = WorkerProfile {
        max_concurrency: 4,
        per_item_timeout_secs: 30,
        run_deadline_secs: 600,
        drain_grace_secs: 30,
        progress_interval_secs: 60,
    };
    let mut config = AppConfig::default();
    config.storage = StorageConfig::Filesystem {
        path: std::env::temp_dir().join("bottlesync-engine-tests"),
    };
    config.sync.target_platforms = vec!["arm64_sonoma".to_string(), "monterey".to_string()];
    config.sync.partial_failure_threshold = 0.10;
    config.workers.lightweight = profile.clone();
    config.workers.batch = profile;
    config.retry = RetryConfig {
        attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: 0.0,
    };
    config.ledger.commit_backoff_ms = 1;
    config.ledger.commit_attempts = 10;
    config
}

/// A catalog record for `formula` on `platform` whose payload is `body`.
#[allow(dead_code)]
pub fn bottle(formula: &str, platform: &str, body: &[u8]) -> (BottleRecord, Bytes) {
    let record = BottleRecord::new(
        BottleKey::new(formula, "1.0", platform).unwrap(),
        ContentHash::compute(body),
        format!("https://bottles.test/{formula}/{platform}"),
        Some(body.len() as u64),
    );
    (record, Bytes::copy_from_slice(body))
}

#[allow(dead_code)]
pub fn ledger_entry(formula: &str, platform: &str) -> LedgerEntry {
    LedgerEntry {
        key: BottleKey::new(formula, "1.0", platform).unwrap(),
        sha256: ContentHash::compute(formula.as_bytes()),
        file_size: 1024,
        download_date: date!(2025 - 07 - 01),
        storage_key: None,
    }
}

/// Engine over `store` with a static catalog, a scripted fetcher and a
/// recording notification sink.
#[allow(dead_code)]
pub fn engine_with(
    config: AppConfig,
    records: Vec<BottleRecord>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<ScriptedFetcher>,
) -> (SyncEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let notifier = Notifier::new(vec![sink.clone()], Duration::from_secs(1));
    let engine = SyncEngine::new(config, Arc::new(StaticCatalog::new(records)), store, fetcher)
        .with_notifier(notifier);
    (engine, sink)
}

/// Deterministic pseudo-random bytes. Same length, same output.
#[allow(dead_code)]
pub fn seeded_payload(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    for chunk in data.chunks_mut(8) {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = state.to_le_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
    Bytes::from(data)
}
