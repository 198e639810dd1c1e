//! Sync orchestration for the bottlesync mirror.
//!
//! A run fetches the catalog, loads the dedup ledger, plans the bottles that
//! are missing, mirrors them with a bounded worker pool and commits the
//! verified results back to the ledger.

pub mod catalog;
pub mod error;
pub mod external;
pub mod hash_store;
pub mod metrics;
pub mod notify;
pub mod retry;
pub mod router;
pub mod run;
pub mod worker;

pub use catalog::{CatalogSource, HomebrewCatalog, parse_catalog};
pub use error::{
    CatalogFetchError, ExternalSourceError, FetchError, LedgerCommitError, NotifyError, SyncError,
    SyncResult,
};
pub use external::ExternalSourceLoader;
pub use hash_store::{
    CommitReport, HashStore, LedgerDelta, LedgerHandle, LedgerSource, LoadMode, LoadedLedger,
};
pub use notify::{NotificationSink, Notifier, SyncEvent, TracingSink, WebhookSink};
pub use retry::RetryPolicy;
pub use router::{Candidate, Router, SyncPlan, WorkerClass};
pub use run::{PlanSummary, RunOptions, RunReport, SyncEngine};
pub use worker::{
    ArtifactFetcher, ArtifactStream, DownloadWorker, HttpFetcher, ProgressSnapshot,
    ProgressTracker, WorkerEvent,
};
