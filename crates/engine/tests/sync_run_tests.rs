// Whole-run behavior over in-memory storage and scripted downloads.

mod common;

use bottlesync_core::config::ExternalHashSource;
use bottlesync_core::{FailureReason, HashLedger, ItemStatus, RunPhase, RunState};
use bottlesync_engine::{HashStore, LedgerDelta, RunOptions, WorkerClass};
use bottlesync_storage::{MemoryBackend, ObjectStore};
use bytes::Bytes;
use common::{ConflictingStore, Reply, ScriptedFetcher, bottle, engine_with, ledger_entry, test_config};
use std::sync::Arc;
use time::macros::date;
use time::OffsetDateTime;

const LEDGER_KEY: &str = "bottles_hash.json";

fn options() -> RunOptions {
    RunOptions {
        run_date: Some(date!(2025 - 07 - 21)),
        dry_run: false,
    }
}

async fn stored_ledger(store: &MemoryBackend) -> HashLedger {
    let data = store.get(LEDGER_KEY).await.unwrap();
    let now = OffsetDateTime::now_utc();
    HashLedger::parse(&data, now.date(), now).unwrap().ledger
}

fn assert_ends_cleanly(phases: &[RunPhase]) {
    assert_eq!(phases.first(), Some(&RunPhase::Init));
    assert!(
        phases.ends_with(&[RunPhase::Terminal, RunPhase::Committed, RunPhase::Notified, RunPhase::Done]),
        "unexpected phases: {phases:?}"
    );
}

#[tokio::test]
async fn test_run_mirrors_new_bottles_and_records_them() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (curl, curl_body) = bottle("curl", "arm64_sonoma", b"curl bottle bytes");
    let (jq, jq_body) = bottle("jq", "monterey", b"jq bottle bytes");
    fetcher.serve(&curl.url, curl_body.clone());
    fetcher.serve(&jq.url, jq_body);

    let (engine, sink) = engine_with(test_config(), vec![curl, jq], store.clone(), fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.result.counts.uploaded, 2);
    assert_eq!(report.ledger_entries, 2);
    assert_eq!(report.phases, vec![
        RunPhase::Init,
        RunPhase::CatalogFetched,
        RunPhase::LedgerLoaded,
        RunPhase::Planned,
        RunPhase::Routed,
        RunPhase::Downloading,
        RunPhase::Terminal,
        RunPhase::Committed,
        RunPhase::Notified,
        RunPhase::Done,
    ]);

    let artifact = "2025-07-21/curl-1.0.arm64_sonoma.bottle.tar.gz";
    assert_eq!(store.get(artifact).await.unwrap(), curl_body);
    let meta = store.head(artifact).await.unwrap();
    assert_eq!(meta.metadata["formula"], "curl");
    assert_eq!(meta.metadata["sync-date"], "2025-07-21");

    let ledger = stored_ledger(&store).await;
    let entry = ledger.get("curl-1.0-arm64_sonoma").unwrap();
    assert_eq!(entry.file_size, curl_body.len() as u64);
    assert_eq!(entry.download_date, date!(2025 - 07 - 21));
    assert_eq!(entry.storage_key.as_deref(), Some(artifact));

    assert_eq!(sink.last_status().as_deref(), Some("SUCCESS"));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (curl, body) = bottle("curl", "arm64_sonoma", b"payload");
    fetcher.serve(&curl.url, body);

    let (engine, _) = engine_with(test_config(), vec![curl.clone()], store.clone(), fetcher.clone());
    assert_eq!(engine.run(options()).await.state(), RunState::Success);
    let document = store.get(LEDGER_KEY).await.unwrap();
    assert_eq!(fetcher.calls(&curl.url), 1);

    let report = engine.run(options()).await;
    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.plan.as_ref().unwrap().candidates, 0);
    assert_eq!(report.plan.as_ref().unwrap().already_present, 1);
    assert_eq!(report.result.counts.total(), 0);
    assert_eq!(report.commit_attempts, 0);
    assert_eq!(fetcher.calls(&curl.url), 1);
    assert_eq!(store.get(LEDGER_KEY).await.unwrap(), document);
}

#[tokio::test]
async fn test_ledger_entries_are_never_fetched_again() {
    let store = Arc::new(MemoryBackend::new());
    let now = OffsetDateTime::now_utc();
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let mut handle = hash_store.load(now.date(), now).await.handle;
    let mut delta = LedgerDelta::new();
    delta.push(ledger_entry("wget", "monterey"));
    hash_store.commit(&mut handle, &delta, now).await.unwrap();

    let fetcher = Arc::new(ScriptedFetcher::new());
    let (wget, wget_body) = bottle("wget", "monterey", b"wget");
    let (jq, jq_body) = bottle("jq", "monterey", b"jq");
    fetcher.serve(&wget.url, wget_body);
    fetcher.serve(&jq.url, jq_body);

    let (engine, _) = engine_with(
        test_config(),
        vec![wget.clone(), jq.clone(), jq.clone()],
        store.clone(),
        fetcher.clone(),
    );
    let report = engine.run(options()).await;

    let plan = report.plan.unwrap();
    assert_eq!(plan.keys, vec!["jq-1.0-monterey".to_string()]);
    assert_eq!(plan.duplicates, 1);
    assert_eq!(fetcher.calls(&wget.url), 0);
    assert_eq!(fetcher.calls(&jq.url), 1);
    assert_eq!(stored_ledger(&store).await.len(), 2);
}

#[tokio::test]
async fn test_small_failure_share_is_partial_success() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let mut records = Vec::new();
    for i in 0..50 {
        let (record, body) = bottle(&format!("formula{i}"), "monterey", format!("body {i}").as_bytes());
        if i % 17 == 0 {
            fetcher.script(&record.url, [Reply::Status(404)]);
        } else {
            fetcher.serve(&record.url, body);
        }
        records.push(record);
    }

    let (engine, sink) = engine_with(test_config(), records, store.clone(), fetcher.clone());
    let report = engine.run(options()).await;

    assert_eq!(report.result.counts.uploaded, 47);
    assert_eq!(report.result.counts.failed, 3);
    assert_eq!(report.state(), RunState::PartialSuccess);
    assert_eq!(report.errors.len(), 3);
    // 404 is not worth a retry.
    assert_eq!(fetcher.calls("https://bottles.test/formula0/monterey"), 1);
    assert_eq!(stored_ledger(&store).await.len(), 47);
    assert_eq!(sink.last_status().as_deref(), Some("PARTIAL_SUCCESS"));
}

#[tokio::test]
async fn test_failure_share_above_threshold_fails_run() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let mut records = Vec::new();
    for i in 0..10 {
        let (record, body) = bottle(&format!("formula{i}"), "monterey", b"body");
        if i < 2 {
            fetcher.script(&record.url, [Reply::Status(503)]);
        } else {
            fetcher.serve(&record.url, body);
        }
        records.push(record);
    }

    let (engine, sink) = engine_with(test_config(), records, store.clone(), fetcher.clone());
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Failed);
    // 503 is retried: first attempt plus two retries.
    assert_eq!(fetcher.calls("https://bottles.test/formula0/monterey"), 3);
    // Successful uploads are kept even though the run failed.
    assert_eq!(stored_ledger(&store).await.len(), 8);
    assert_eq!(sink.last_status().as_deref(), Some("FAILED"));
    assert_ends_cleanly(&report.phases);
}

#[tokio::test]
async fn test_transient_errors_recover_within_retry_budget() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, body) = bottle("curl", "arm64_sonoma", b"bottle");
    fetcher.script(&record.url, [Reply::Status(502), Reply::Status(429), Reply::Body(body)]);

    let (engine, _) = engine_with(test_config(), vec![record], store, fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.outcomes[0].attempts, 3);
}

#[tokio::test]
async fn test_repeated_digest_mismatch_fails_item_and_publishes_nothing() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, _) = bottle("curl", "arm64_sonoma", b"expected");
    fetcher.serve(&record.url, Bytes::from_static(b"tampered"));

    let (engine, _) = engine_with(test_config(), vec![record.clone()], store.clone(), fetcher.clone());
    let report = engine.run(options()).await;

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.attempts, 2);
    assert!(matches!(
        &outcome.status,
        ItemStatus::Failed(FailureReason::HashMismatch { expected, .. }) if *expected == record.sha256
    ));
    assert_eq!(fetcher.calls(&record.url), 2);
    assert!(!store
        .exists("2025-07-21/curl-1.0.arm64_sonoma.bottle.tar.gz")
        .await
        .unwrap());
    assert!(!store.exists(LEDGER_KEY).await.unwrap());
}

#[tokio::test]
async fn test_single_digest_mismatch_is_retried() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, body) = bottle("curl", "arm64_sonoma", b"expected");
    fetcher.script(&record.url, [Reply::Body(Bytes::from_static(b"truncated")), Reply::Body(body)]);

    let (engine, _) = engine_with(test_config(), vec![record], store, fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.outcomes[0].attempts, 2);
}

#[tokio::test]
async fn test_catalog_failure_still_notifies() {
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryBackend::new());
    let sink = Arc::new(common::RecordingSink::default());
    let engine = bottlesync_engine::SyncEngine::new(
        test_config(),
        Arc::new(common::StaticCatalog::unavailable()),
        store.clone(),
        Arc::new(ScriptedFetcher::new()),
    )
    .with_notifier(bottlesync_engine::Notifier::new(
        vec![sink.clone()],
        std::time::Duration::from_secs(1),
    ));

    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Failed);
    assert!(report.plan.is_none());
    assert_eq!(report.errors.len(), 1);
    assert_ends_cleanly(&report.phases);
    assert_eq!(
        &report.phases[..3],
        &[RunPhase::Init, RunPhase::CatalogFetched, RunPhase::Terminal]
    );
    assert!(!report.phases.contains(&RunPhase::LedgerLoaded));
    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, "FAILED");
    assert_eq!(events[0].errors.len(), 1);
    assert!(store.list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_commit_conflicts_fail_run_but_keep_uploads() {
    let store = Arc::new(ConflictingStore::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, body) = bottle("curl", "arm64_sonoma", b"bottle");
    fetcher.serve(&record.url, body);
    let mut config = test_config();
    config.ledger.commit_attempts = 3;

    let (engine, sink) = engine_with(config, vec![record], store.clone(), fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.result.counts.uploaded, 1);
    assert_eq!(report.state(), RunState::Failed);
    assert_eq!(report.commit_attempts, 3);
    assert!(report.errors.iter().any(|e| e.contains("3 consecutive races")));
    assert!(store
        .exists("2025-07-21/curl-1.0.arm64_sonoma.bottle.tar.gz")
        .await
        .unwrap());
    assert_eq!(sink.last_status().as_deref(), Some("FAILED"));
    assert_ends_cleanly(&report.phases);
}

#[tokio::test]
async fn test_dry_run_plans_without_writing() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (small, _) = bottle("jq", "monterey", b"jq");
    let mut config = test_config();
    config.sync.size_threshold_bytes = 2;

    let (engine, sink) = engine_with(config, vec![small], store.clone(), fetcher.clone());
    let report = engine
        .run(RunOptions {
            dry_run: true,
            ..options()
        })
        .await;

    assert!(report.dry_run);
    let plan = report.plan.as_ref().unwrap();
    assert_eq!(plan.candidates, 1);
    assert_eq!(plan.total_estimated_bytes, 2);
    assert_eq!(plan.worker, WorkerClass::Batch);
    assert!(!report.phases.contains(&RunPhase::Downloading));
    assert_ends_cleanly(&report.phases);
    assert_eq!(fetcher.total_calls(), 0);
    assert!(store.list("").await.unwrap().is_empty());
    assert_eq!(sink.events().len(), 1);
}

#[tokio::test]
async fn test_unreachable_external_source_warns_once() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, body) = bottle("curl", "arm64_sonoma", b"bottle");
    fetcher.serve(&record.url, body);
    let mut config = test_config();
    config.sync.external_hash_source = ExternalHashSource::HttpsUrl {
        url: "https://127.0.0.1:1/bottles_hash.json".to_string(),
    };

    let (engine, _) = engine_with(config, vec![record], store, fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
    assert_eq!(report.state(), RunState::Success);
}

#[tokio::test]
async fn test_external_source_preseeds_dedup_state() {
    let store = Arc::new(MemoryBackend::new());
    store
        .put(
            "peer/bottles_hash.json",
            Bytes::from(format!(
                r#"{{"last_updated":"2025-07-20T00:00:00Z","bottles":{{"curl-1.0-arm64_sonoma":{{"sha256":"{}","download_date":"2025-07-20","file_size":6}}}}}}"#,
                bottlesync_core::ContentHash::compute(b"bottle").to_hex()
            )),
        )
        .await
        .unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, body) = bottle("curl", "arm64_sonoma", b"bottle");
    fetcher.serve(&record.url, body);
    let mut config = test_config();
    config.sync.external_hash_source = ExternalHashSource::ObjectKey {
        key: "peer/bottles_hash.json".to_string(),
    };

    let (engine, _) = engine_with(config, vec![record.clone()], store.clone(), fetcher.clone());
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(fetcher.calls(&record.url), 0);
    // Merged entries are persisted with the run's commit.
    assert!(stored_ledger(&store).await.contains("curl-1.0-arm64_sonoma"));
}

#[tokio::test]
async fn test_corrupt_ledger_is_replaced_with_warning() {
    let store = Arc::new(MemoryBackend::new());
    store
        .put(LEDGER_KEY, Bytes::from_static(b"<html>oops</html>"))
        .await
        .unwrap();
    let (engine, _) = engine_with(test_config(), Vec::new(), store.clone(), Arc::new(ScriptedFetcher::new()));

    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.warnings.len(), 1);
    assert!(stored_ledger(&store).await.is_empty());
    assert_eq!(store.list("backups/").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dry_run_leaves_corrupt_ledger_untouched() {
    let store = Arc::new(MemoryBackend::new());
    store
        .put(LEDGER_KEY, Bytes::from_static(b"{not json"))
        .await
        .unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (record, _) = bottle("curl", "arm64_sonoma", b"bottle");
    let mut config = test_config();
    config.ledger.rebuild_on_corruption = true;
    let (engine, _) = engine_with(config, vec![record], store.clone(), fetcher.clone());
    let before = store.list("").await.unwrap();

    let report = engine
        .run(RunOptions {
            dry_run: true,
            ..options()
        })
        .await;

    assert_eq!(report.state(), RunState::Success);
    assert_eq!(report.plan.as_ref().unwrap().candidates, 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("left in place"), "{:?}", report.warnings);
    assert_eq!(store.list("").await.unwrap(), before);
    assert_eq!(store.get(LEDGER_KEY).await.unwrap(), Bytes::from_static(b"{not json"));
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn test_checkpoints_commit_during_the_run() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let mut records = Vec::new();
    for i in 0..5 {
        let (record, body) = bottle(&format!("formula{i}"), "monterey", b"body");
        fetcher.serve(&record.url, body);
        records.push(record);
    }
    let mut config = test_config();
    config.ledger.checkpoint_every = Some(2);

    let (engine, _) = engine_with(config, records, store.clone(), fetcher);
    let report = engine.run(options()).await;

    assert_eq!(report.state(), RunState::Success);
    // Two checkpoints and the final commit for the fifth item.
    assert_eq!(report.commit_attempts, 3);
    assert_eq!(stored_ledger(&store).await.len(), 5);
}
