//! Candidate selection, size estimation and worker routing.

use bottlesync_core::config::{SizeFallback, SyncConfig};
use bottlesync_core::{BottleRecord, HashLedger, LedgerStatistics};
use serde::Serialize;
use std::collections::HashSet;

/// Which worker profile runs the plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
    Lightweight,
    Batch,
}

impl WorkerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lightweight => "lightweight",
            Self::Batch => "batch",
        }
    }
}

/// A catalog record that is not yet mirrored.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub record: BottleRecord,
    /// Catalog size, or the fallback estimate.
    pub estimated_size: u64,
    /// True when `estimated_size` did not come from the catalog.
    pub size_estimated: bool,
}

/// Work for one run. Never persisted.
#[derive(Clone, Debug)]
pub struct SyncPlan {
    pub candidates: Vec<Candidate>,
    pub total_estimated_bytes: u64,
    /// Some sizes were unknown and no statistics existed to estimate them.
    pub estimate_degraded: bool,
    pub worker: WorkerClass,
    /// Catalog records skipped because the ledger already has them.
    pub already_present: usize,
    /// Catalog records collapsed into an earlier record with the same key.
    pub duplicates: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}

/// Pure planner: the same catalog and ledger always give the same plan.
#[derive(Clone, Debug)]
pub struct Router {
    threshold: u64,
    fallback: SizeFallback,
}

impl Router {
    pub fn new(threshold: u64, fallback: SizeFallback) -> Self {
        Self { threshold, fallback }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.size_threshold_bytes, config.size_fallback.clone())
    }

    /// Pick the worker class for an estimated payload. The boundary is inclusive.
    pub fn route(&self, total_estimated_bytes: u64) -> WorkerClass {
        if total_estimated_bytes >= self.threshold {
            WorkerClass::Batch
        } else {
            WorkerClass::Lightweight
        }
    }

    fn estimate(&self, platform: &str, stats: Option<&LedgerStatistics>) -> Option<u64> {
        match &self.fallback {
            SizeFallback::Fixed { bytes } => Some(*bytes),
            SizeFallback::GlobalMean => stats.and_then(LedgerStatistics::global_mean),
            SizeFallback::PlatformMean => {
                stats.and_then(|s| s.platform_mean(platform).or_else(|| s.global_mean()))
            }
        }
    }

    pub fn plan(&self, catalog: &[BottleRecord], ledger: &HashLedger) -> SyncPlan {
        let stats = ledger.statistics();
        let mut seen = HashSet::with_capacity(catalog.len());
        let mut candidates = Vec::new();
        let mut total: u64 = 0;
        let mut degraded = false;
        let mut already_present = 0;
        let mut duplicates = 0;

        for record in catalog {
            let key = record.ledger_key();
            if !seen.insert(key.clone()) {
                duplicates += 1;
                continue;
            }
            if ledger.contains(&key) {
                already_present += 1;
                continue;
            }

            let (estimated_size, size_estimated) = match record.size {
                Some(size) => (size, false),
                None => match self.estimate(record.key.platform(), stats) {
                    Some(estimate) => (estimate, true),
                    None => {
                        degraded = true;
                        (0, true)
                    }
                },
            };
            total = total.saturating_add(estimated_size);
            candidates.push(Candidate {
                record: record.clone(),
                estimated_size,
                size_estimated,
            });
        }

        let worker = self.route(total);
        if degraded {
            tracing::warn!(
                candidates = candidates.len(),
                "no ledger statistics to estimate unknown sizes, routing on a partial total"
            );
        }
        tracing::info!(
            candidates = candidates.len(),
            already_present,
            duplicates,
            total_estimated_bytes = total,
            worker = worker.as_str(),
            "sync plan ready"
        );

        SyncPlan {
            candidates,
            total_estimated_bytes: total,
            estimate_degraded: degraded,
            worker,
            already_present,
            duplicates,
        }
    }
}
