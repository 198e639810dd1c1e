//! Core domain types for the bottlesync mirror.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Bottle identity and catalog records
//! - The dedup ledger document and its validation
//! - Per-item outcomes and run results
//! - Configuration

pub mod bottle;
pub mod config;
pub mod error;
pub mod format;
pub mod hash;
pub mod ledger;
pub mod outcome;

pub use bottle::{BottleKey, BottleRecord};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use ledger::{HashLedger, LedgerEntry, LedgerStatistics, MergeSummary, ParsedLedger};
pub use outcome::{
    FailureReason, ItemOutcome, ItemStatus, OutcomeCounts, RunPhase, RunResult, RunState,
};
