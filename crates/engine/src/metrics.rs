//! Prometheus metrics for sync runs.
//!
//! Everything registers into [`REGISTRY`]. The binary renders it with
//! [`render_text`] into a node_exporter textfile after each run.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Run metrics
pub static RUNS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("bottlesync_runs_total", "Completed sync runs by terminal state"),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static RUN_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "bottlesync_run_duration_seconds",
            "Wall-clock duration of a sync run",
        )
        .buckets(vec![
            1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 10800.0, 21600.0,
        ]),
    )
    .expect("metric creation failed")
});

pub static PLANNED_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "bottlesync_planned_bytes",
        "Estimated bytes to download in the most recent plan",
    )
    .expect("metric creation failed")
});

pub static CANDIDATES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "bottlesync_candidates",
        "Candidates in the most recent plan",
    )
    .expect("metric creation failed")
});

// Item metrics
pub static ITEMS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("bottlesync_items_total", "Per-item outcomes by result"),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_bytes_uploaded_total",
        "Verified bytes published to object storage",
    )
    .expect("metric creation failed")
});

pub static FETCH_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_fetch_retries_total",
        "Artifact fetch attempts retried after a network or storage error",
    )
    .expect("metric creation failed")
});

pub static HASH_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_hash_mismatches_total",
        "Downloads whose digest did not match the catalog",
    )
    .expect("metric creation failed")
});

pub static ITEM_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "bottlesync_item_duration_seconds",
            "Time to fetch, verify and publish one bottle",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0]),
    )
    .expect("metric creation failed")
});

// Ledger metrics
pub static LEDGER_COMMITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_ledger_commits_total",
        "Ledger documents published",
    )
    .expect("metric creation failed")
});

pub static LEDGER_COMMIT_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_ledger_commit_conflicts_total",
        "Conditional ledger writes rejected because another writer got there first",
    )
    .expect("metric creation failed")
});

pub static LEDGER_ENTRIES_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_ledger_entries_dropped_total",
        "Ledger entries discarded during validation",
    )
    .expect("metric creation failed")
});

pub static LEDGER_RECOVERIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_ledger_recoveries_total",
        "Runs that started from an empty or rebuilt ledger after a read failure",
    )
    .expect("metric creation failed")
});

pub static LEDGER_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "bottlesync_ledger_entries",
        "Entries in the ledger after the most recent commit",
    )
    .expect("metric creation failed")
});

// Collaborator failures
pub static EXTERNAL_SOURCE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "bottlesync_external_source_failures_total",
        "Supplementary ledger loads that failed",
    )
    .expect("metric creation failed")
});

pub static NOTIFICATION_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "bottlesync_notification_failures_total",
            "Notification deliveries that failed or timed out, by sink",
        ),
        &["sink"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(RUNS_TOTAL.clone()),
            Box::new(RUN_DURATION.clone()),
            Box::new(PLANNED_BYTES.clone()),
            Box::new(CANDIDATES.clone()),
            Box::new(ITEMS_TOTAL.clone()),
            Box::new(BYTES_UPLOADED.clone()),
            Box::new(FETCH_RETRIES.clone()),
            Box::new(HASH_MISMATCHES.clone()),
            Box::new(ITEM_DURATION.clone()),
            Box::new(LEDGER_COMMITS.clone()),
            Box::new(LEDGER_COMMIT_CONFLICTS.clone()),
            Box::new(LEDGER_ENTRIES_DROPPED.clone()),
            Box::new(LEDGER_RECOVERIES.clone()),
            Box::new(LEDGER_ENTRIES.clone()),
            Box::new(EXTERNAL_SOURCE_FAILURES.clone()),
            Box::new(NOTIFICATION_FAILURES.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// Render the registry in the Prometheus text exposition format.
pub fn render_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Record one per-item outcome.
pub fn record_item(result: &str) {
    ITEMS_TOTAL.with_label_values(&[result]).inc();
}
