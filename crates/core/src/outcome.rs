//! Per-item and per-run results, and the run state machine.

use crate::bottle::BottleKey;
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a candidate could not be mirrored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Downloaded bytes did not match the catalog digest.
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    /// Connection, HTTP or timeout failure fetching the artifact.
    Network { message: String },
    /// Writing the artifact to object storage failed.
    Storage { message: String },
    /// The run deadline passed before the item completed or was admitted.
    DeadlineExceeded,
}

impl FailureReason {
    /// Short label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::Network { .. } => "network",
            Self::Storage { .. } => "storage",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch: expected {expected}, got {actual}")
            }
            Self::Network { message } => write!(f, "network: {message}"),
            Self::Storage { message } => write!(f, "storage: {message}"),
            Self::DeadlineExceeded => write!(f, "run deadline exceeded"),
        }
    }
}

/// What happened to one candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemStatus {
    Uploaded {
        storage_key: String,
        sha256: ContentHash,
    },
    /// Already present in the ledger when the worker reached it.
    SkippedAlreadyPresent,
    Failed(FailureReason),
}

/// Per-candidate result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemOutcome {
    pub key: BottleKey,
    pub status: ItemStatus,
    pub bytes_transferred: u64,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl ItemOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self.status, ItemStatus::Uploaded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            ItemStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Terminal health of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Success,
    PartialSuccess,
    Failed,
}

impl RunState {
    /// Classify item counts against a failure-rate threshold in `[0, 1]`.
    ///
    /// The rate is failures over every candidate the run was responsible for,
    /// skipped ones included. Zero failures is always `Success`.
    pub fn classify(counts: &OutcomeCounts, partial_failure_threshold: f64) -> Self {
        if counts.failed == 0 {
            return Self::Success;
        }
        if counts.failure_rate() <= partial_failure_threshold {
            Self::PartialSuccess
        } else {
            Self::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of a single run, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Init,
    CatalogFetched,
    LedgerLoaded,
    Planned,
    Routed,
    Downloading,
    Terminal,
    Committed,
    Notified,
    Done,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::CatalogFetched => "CATALOG_FETCHED",
            Self::LedgerLoaded => "LEDGER_LOADED",
            Self::Planned => "PLANNED",
            Self::Routed => "ROUTED",
            Self::Downloading => "DOWNLOADING",
            Self::Terminal => "TERMINAL",
            Self::Committed => "COMMITTED",
            Self::Notified => "NOTIFIED",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item tallies for a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl OutcomeCounts {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a ItemOutcome>) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            counts.record(outcome);
        }
        counts
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome.status {
            ItemStatus::Uploaded { .. } => self.uploaded += 1,
            ItemStatus::SkippedAlreadyPresent => self.skipped += 1,
            ItemStatus::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.uploaded + self.failed + self.skipped
    }

    pub fn failure_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failed as f64 / total as f64,
        }
    }
}

/// Aggregate result of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
    pub state: RunState,
    pub counts: OutcomeCounts,
    pub total_bytes: u64,
    pub duration: Duration,
}
