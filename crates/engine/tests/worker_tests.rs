// Download worker scheduling: re-checks, deadlines and draining.

mod common;

use bottlesync_core::config::WorkerProfile;
use bottlesync_core::{FailureReason, HashLedger, ItemOutcome, ItemStatus};
use bottlesync_engine::{
    Candidate, DownloadWorker, HashStore, LedgerDelta, RetryPolicy, WorkerClass, WorkerEvent,
};
use bottlesync_storage::{MemoryBackend, ObjectStore};
use bytes::Bytes;
use common::{Reply, ScriptedFetcher, StallingPublishStore, bottle, test_config};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::date;
use tokio::sync::mpsc;

fn candidate(formula: &str, fetcher: &ScriptedFetcher, reply: Reply) -> Candidate {
    let (record, _) = bottle(formula, "monterey", formula.as_bytes());
    fetcher.script(&record.url, [reply]);
    Candidate {
        estimated_size: record.size.unwrap_or(0),
        size_estimated: false,
        record,
    }
}

fn worker(store: Arc<MemoryBackend>, fetcher: Arc<ScriptedFetcher>, profile: WorkerProfile) -> DownloadWorker {
    DownloadWorker::new(
        store,
        fetcher,
        profile,
        WorkerClass::Lightweight,
        RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.0),
        date!(2025 - 07 - 21),
    )
}

fn is_deadline(outcome: &ItemOutcome) -> bool {
    matches!(outcome.status, ItemStatus::Failed(FailureReason::DeadlineExceeded))
}

#[tokio::test]
async fn test_item_added_after_planning_is_skipped() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let now = OffsetDateTime::now_utc();
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let mut handle = hash_store.load(now.date(), now).await.handle;

    let jq = candidate("jq", &fetcher, Reply::Body(Bytes::from_static(b"jq")));
    // Another writer records jq between planning and download.
    let mut incoming = HashLedger::empty(now);
    incoming.upsert(common::ledger_entry("jq", "monterey"));
    hash_store.merge(&mut handle, &mut LedgerDelta::new(), incoming, now);

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker(store, fetcher.clone(), test_config().workers.lightweight)
        .run(vec![jq], &hash_store, tx)
        .await;

    assert_eq!(outcomes[0].status, ItemStatus::SkippedAlreadyPresent);
    assert_eq!(outcomes[0].attempts, 0);
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_in_flight_and_fails_unadmitted() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let candidates = vec![
        candidate("a", &fetcher, Reply::Hang),
        candidate("b", &fetcher, Reply::Hang),
        candidate("c", &fetcher, Reply::Hang),
    ];
    let profile = WorkerProfile {
        max_concurrency: 2,
        per_item_timeout_secs: 3600,
        run_deadline_secs: 10,
        drain_grace_secs: 2,
        progress_interval_secs: 1,
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcomes = worker(store.clone(), fetcher.clone(), profile)
        .run(candidates, &hash_store, tx)
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(is_deadline));
    let admitted: Vec<_> = outcomes.iter().filter(|o| o.attempts == 1).collect();
    assert_eq!(admitted.len(), 2);
    assert_eq!(fetcher.total_calls(), 2);
    // Cancelled uploads were aborted.
    assert!(store.is_empty());

    let mut progress_events = 0;
    let mut outcome_events = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            WorkerEvent::Progress(_) => progress_events += 1,
            WorkerEvent::Outcome(_) => outcome_events += 1,
        }
    }
    assert_eq!(outcome_events, 3);
    assert!(progress_events >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_admission_stops_before_deadline() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let slow = |formula: &str| {
        Reply::Delayed(Duration::from_secs(3), Bytes::copy_from_slice(formula.as_bytes()))
    };
    let candidates = vec![
        candidate("a", &fetcher, slow("a")),
        candidate("b", &fetcher, slow("b")),
        candidate("c", &fetcher, slow("c")),
    ];
    let profile = WorkerProfile {
        max_concurrency: 1,
        per_item_timeout_secs: 60,
        run_deadline_secs: 10,
        drain_grace_secs: 5,
        progress_interval_secs: 60,
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker(store.clone(), fetcher, profile)
        .run(candidates, &hash_store, tx)
        .await;

    let uploaded = outcomes.iter().filter(|o| o.is_uploaded()).count();
    assert_eq!(uploaded, 2);
    let unadmitted: Vec<_> = outcomes.iter().filter(|o| is_deadline(o)).collect();
    assert_eq!(unadmitted.len(), 1);
    assert_eq!(unadmitted[0].attempts, 0);
    assert_eq!(unadmitted[0].key.formula(), "c");
}

#[tokio::test(start_paused = true)]
async fn test_per_item_timeout_applies_per_attempt() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let (record, body) = bottle("jq", "monterey", b"jq");
    fetcher.script(&record.url, [Reply::Hang, Reply::Body(body)]);
    let profile = WorkerProfile {
        max_concurrency: 1,
        per_item_timeout_secs: 5,
        run_deadline_secs: 600,
        drain_grace_secs: 30,
        progress_interval_secs: 60,
    };

    let worker = DownloadWorker::new(
        store,
        fetcher,
        profile,
        WorkerClass::Batch,
        RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10), 0.0),
        date!(2025 - 07 - 21),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker
        .run(
            vec![Candidate {
                record,
                estimated_size: 2,
                size_estimated: false,
            }],
            &hash_store,
            tx,
        )
        .await;

    assert!(outcomes[0].is_uploaded());
    assert_eq!(outcomes[0].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_publish_stops_at_run_deadline() {
    let store = Arc::new(StallingPublishStore::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let jq = candidate("jq", &fetcher, Reply::Body(Bytes::from_static(b"jq")));
    let profile = WorkerProfile {
        max_concurrency: 1,
        per_item_timeout_secs: 3600,
        run_deadline_secs: 10,
        drain_grace_secs: 2,
        progress_interval_secs: 60,
    };

    let worker = DownloadWorker::new(
        store.clone(),
        fetcher,
        profile,
        WorkerClass::Lightweight,
        RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.0),
        date!(2025 - 07 - 21),
    );
    let started = tokio::time::Instant::now();
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker.run(vec![jq], &hash_store, tx).await;

    assert!(is_deadline(&outcomes[0]), "{:?}", outcomes[0].status);
    assert_eq!(outcomes[0].attempts, 1);
    assert!(started.elapsed() <= Duration::from_secs(11));
    assert!(store.list("").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_publish_counts_against_item_timeout() {
    let store = Arc::new(StallingPublishStore::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let jq = candidate("jq", &fetcher, Reply::Body(Bytes::from_static(b"jq")));
    let profile = WorkerProfile {
        max_concurrency: 1,
        per_item_timeout_secs: 5,
        run_deadline_secs: 600,
        drain_grace_secs: 30,
        progress_interval_secs: 60,
    };

    let worker = DownloadWorker::new(
        store,
        fetcher,
        profile,
        WorkerClass::Lightweight,
        RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.0),
        date!(2025 - 07 - 21),
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker.run(vec![jq], &hash_store, tx).await;

    assert!(
        matches!(&outcomes[0].status, ItemStatus::Failed(FailureReason::Storage { message }) if message.contains("exceeded 5s")),
        "{:?}",
        outcomes[0].status
    );
}

#[tokio::test]
async fn test_oversized_deadline_does_not_overflow() {
    let store = Arc::new(MemoryBackend::new());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let hash_store = HashStore::new(store.clone(), test_config().ledger);
    let jq = candidate("jq", &fetcher, Reply::Body(Bytes::from_static(b"jq")));
    let profile = WorkerProfile {
        max_concurrency: 1,
        per_item_timeout_secs: u64::MAX,
        run_deadline_secs: u64::MAX,
        drain_grace_secs: 1,
        progress_interval_secs: u64::MAX,
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcomes = worker(store, fetcher, profile)
        .run(vec![jq], &hash_store, tx)
        .await;

    assert!(outcomes[0].is_uploaded());
}
