//! One sync run, end to end.
//!
//! `INIT → CATALOG_FETCHED → LEDGER_LOADED → PLANNED → ROUTED → DOWNLOADING →
//! terminal → COMMITTED → NOTIFIED → DONE`. Every run ends in `DONE` and emits
//! a final event, whatever went wrong on the way.

use crate::catalog::{CatalogSource, HomebrewCatalog};
use crate::error::{SyncError, SyncResult};
use crate::external::ExternalSourceLoader;
use crate::hash_store::{HashStore, LedgerDelta, LedgerHandle, LedgerSource, LoadMode};
use crate::metrics;
use crate::notify::{Notifier, SyncEvent};
use crate::retry::RetryPolicy;
use crate::router::{Router, SyncPlan, WorkerClass};
use crate::worker::{ArtifactFetcher, DownloadWorker, HttpFetcher, WorkerEvent};
use bottlesync_core::config::{AppConfig, WorkerProfile};
use bottlesync_core::format::{format_duration, format_size};
use bottlesync_core::{
    ItemOutcome, ItemStatus, LedgerEntry, OutcomeCounts, RunPhase, RunResult, RunState,
};
use bottlesync_storage::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use time::{Date, OffsetDateTime};
use tokio::sync::mpsc;

/// Per-run switches.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Date used for artifact keys and new ledger entries. Defaults to today (UTC).
    pub run_date: Option<Date>,
    /// Plan and route only. Nothing is downloaded or written.
    pub dry_run: bool,
}

/// What the router decided.
#[derive(Clone, Debug, Serialize)]
pub struct PlanSummary {
    pub candidates: usize,
    pub total_estimated_bytes: u64,
    pub estimate_degraded: bool,
    pub worker: WorkerClass,
    pub already_present: usize,
    pub duplicates: usize,
    /// Ledger keys of the candidates, in catalog order.
    pub keys: Vec<String>,
}

impl From<&SyncPlan> for PlanSummary {
    fn from(plan: &SyncPlan) -> Self {
        Self {
            candidates: plan.len(),
            total_estimated_bytes: plan.total_estimated_bytes,
            estimate_degraded: plan.estimate_degraded,
            worker: plan.worker,
            already_present: plan.already_present,
            duplicates: plan.duplicates,
            keys: plan
                .candidates
                .iter()
                .map(|c| c.record.ledger_key())
                .collect(),
        }
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub result: RunResult,
    /// Phases passed, in order.
    pub phases: Vec<RunPhase>,
    pub plan: Option<PlanSummary>,
    /// Recovered problems (ledger recovery, external source).
    pub warnings: Vec<String>,
    /// Item failures and fatal errors.
    pub errors: Vec<String>,
    pub outcomes: Vec<ItemOutcome>,
    /// Entries in the ledger at the end of the run.
    pub ledger_entries: usize,
    /// Conditional writes spent on commits, checkpoints included.
    pub commit_attempts: u32,
    pub dry_run: bool,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.result.state
    }
}

/// Mutable bookkeeping for one run.
struct RunContext {
    started: Instant,
    phases: Vec<RunPhase>,
    warnings: Vec<String>,
    errors: Vec<String>,
    commit_attempts: u32,
}

impl RunContext {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            phases: vec![RunPhase::Init],
            warnings: Vec::new(),
            errors: Vec::new(),
            commit_attempts: 0,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(phase = phase.as_str(), "run phase");
        self.phases.push(phase);
    }

    fn duration_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Wires catalog, ledger, router, worker and notifier together.
pub struct SyncEngine {
    config: AppConfig,
    catalog: Arc<dyn CatalogSource>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    external: ExternalSourceLoader,
    notifier: Notifier,
}

impl SyncEngine {
    /// Build an engine from explicit parts. Notifications go to the log only.
    pub fn new(
        config: AppConfig,
        catalog: Arc<dyn CatalogSource>,
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let external =
            ExternalSourceLoader::new(store.clone(), config.storage.clone(), reqwest::Client::new());
        Self {
            config,
            catalog,
            store,
            fetcher,
            external,
            notifier: Notifier::default(),
        }
    }

    /// Build the production engine: Homebrew catalog, configured storage,
    /// HTTPS fetcher and configured notification sinks.
    pub async fn from_config(config: AppConfig) -> SyncResult<Self> {
        config.validate().map_err(SyncError::Config)?;
        metrics::register_metrics();

        let store = bottlesync_storage::from_config(&config.storage).await?;
        let client = reqwest::Client::builder()
            .user_agent(config.catalog.user_agent.clone())
            .build()
            .map_err(|e| SyncError::HttpClient(e.to_string()))?;
        let catalog = HomebrewCatalog::new(
            &config.catalog,
            &config.sync.target_platforms,
            RetryPolicy::from_config(&config.retry),
        )?;
        let notifier = Notifier::from_config(&config.notifications, client.clone())
            .map_err(|e| SyncError::Config(e.to_string()))?;
        let external = ExternalSourceLoader::new(store.clone(), config.storage.clone(), client.clone());

        Ok(Self {
            config,
            catalog: Arc::new(catalog),
            store,
            fetcher: Arc::new(HttpFetcher::new(client)),
            external,
            notifier,
        })
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// A fresh hash store over this engine's storage.
    pub fn hash_store(&self) -> HashStore {
        HashStore::new(self.store.clone(), self.config.ledger.clone())
    }

    fn profile(&self, class: WorkerClass) -> &WorkerProfile {
        match class {
            WorkerClass::Lightweight => &self.config.workers.lightweight,
            WorkerClass::Batch => &self.config.workers.batch,
        }
    }

    /// Execute one run. Never returns early: failures become the run's state.
    pub async fn run(&self, options: RunOptions) -> RunReport {
        let now = OffsetDateTime::now_utc();
        let today = now.date();
        let run_date = options.run_date.unwrap_or(today);
        let mut ctx = RunContext::new();

        tracing::info!(
            run_date = %run_date,
            dry_run = options.dry_run,
            storage = self.store.backend_name(),
            "sync run starting"
        );

        let fetched = self.catalog.fetch().await;
        ctx.enter(RunPhase::CatalogFetched);
        let catalog = match fetched {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "catalog fetch failed");
                ctx.errors.push(e.to_string());
                ctx.enter(RunPhase::Terminal);
                ctx.enter(RunPhase::Committed);
                return self
                    .finish(ctx, RunState::Failed, Vec::new(), None, 0, options.dry_run)
                    .await;
            }
        };
        tracing::info!(records = catalog.len(), "catalog fetched");

        let hash_store = self.hash_store();
        let mode = if options.dry_run {
            LoadMode::ReadOnly
        } else {
            LoadMode::Recover
        };
        let loaded = hash_store.load_with_mode(today, now, mode).await;
        let needs_rewrite = loaded.needs_rewrite();
        match &loaded.source {
            LedgerSource::Unreadable { error } => {
                ctx.warnings.push(format!("ledger unreadable, started empty: {error}"));
            }
            LedgerSource::Recovered { backup_key, rebuilt } => ctx.warnings.push(format!(
                "ledger corrupt, {} (backup: {})",
                if *rebuilt { "rebuilt from artifacts" } else { "started empty" },
                backup_key.as_deref().unwrap_or("none")
            )),
            LedgerSource::Corrupt { error, rebuilt } => ctx.warnings.push(format!(
                "ledger corrupt, left in place and {}: {error}",
                if *rebuilt { "rebuilt from artifacts" } else { "treated as empty" }
            )),
            LedgerSource::Stored | LedgerSource::Missing => {}
        }
        if !loaded.dropped.is_empty() {
            ctx.warnings.push(format!(
                "{} invalid ledger entries dropped",
                loaded.dropped.len()
            ));
        }
        let mut handle = loaded.handle;
        let mut delta = LedgerDelta::new();

        let source = &self.config.sync.external_hash_source;
        match self.external.load(source, today, now).await {
            Ok(Some(parsed)) => {
                hash_store.merge(&mut handle, &mut delta, parsed.ledger, now);
            }
            Ok(None) => {}
            Err(e) => {
                metrics::EXTERNAL_SOURCE_FAILURES.inc();
                tracing::warn!(error = %e, "external hash source unavailable, continuing without it");
                ctx.warnings.push(e.to_string());
            }
        }
        metrics::LEDGER_ENTRIES.set(handle.ledger().len() as i64);
        ctx.enter(RunPhase::LedgerLoaded);

        let router = Router::from_config(&self.config.sync);
        let plan = router.plan(&catalog, handle.ledger());
        ctx.enter(RunPhase::Planned);
        metrics::CANDIDATES.set(plan.len() as i64);
        metrics::PLANNED_BYTES.set(plan.total_estimated_bytes.min(i64::MAX as u64) as i64);
        let summary = PlanSummary::from(&plan);
        ctx.enter(RunPhase::Routed);
        tracing::info!(
            candidates = plan.len(),
            estimated = %format_size(plan.total_estimated_bytes),
            worker = plan.worker.as_str(),
            "plan routed"
        );

        if options.dry_run {
            ctx.enter(RunPhase::Terminal);
            ctx.enter(RunPhase::Committed);
            return self
                .finish(ctx, RunState::Success, Vec::new(), Some(summary), handle.ledger().len(), true)
                .await;
        }

        ctx.enter(RunPhase::Downloading);
        self.notifier
            .emit(&SyncEvent {
                phase: RunPhase::Downloading,
                status: "RUNNING".to_string(),
                counts: OutcomeCounts::default(),
                duration_ms: ctx.duration_ms(),
                errors: Vec::new(),
                progress: None,
            })
            .await;

        let worker = DownloadWorker::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.profile(plan.worker).clone(),
            plan.worker,
            RetryPolicy::from_config(&self.config.retry),
            run_date,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let checkpoint_every = self.config.ledger.checkpoint_every;

        let consume = async {
            let mut counts = OutcomeCounts::default();
            let mut since_checkpoint = 0usize;
            while let Some(event) = rx.recv().await {
                match event {
                    WorkerEvent::Outcome(outcome) => {
                        counts.record(&outcome);
                        let ItemStatus::Uploaded { storage_key, sha256 } = &outcome.status else {
                            continue;
                        };
                        delta.push(LedgerEntry {
                            key: outcome.key.clone(),
                            sha256: *sha256,
                            file_size: outcome.bytes_transferred,
                            download_date: run_date,
                            storage_key: Some(storage_key.clone()),
                        });
                        since_checkpoint += 1;
                        if checkpoint_every.is_some_and(|every| since_checkpoint >= every) {
                            match hash_store
                                .commit(&mut handle, &delta, OffsetDateTime::now_utc())
                                .await
                            {
                                Ok(report) => {
                                    ctx.commit_attempts += report.attempts;
                                    delta.clear();
                                    since_checkpoint = 0;
                                    tracing::info!(entries = report.entries, "checkpoint committed");
                                }
                                Err(e) => {
                                    ctx.commit_attempts += self.config.ledger.commit_attempts;
                                    tracing::warn!(error = %e, "checkpoint commit failed, keeping entries for the final commit");
                                }
                            }
                        }
                    }
                    WorkerEvent::Progress(snapshot) => {
                        self.notifier
                            .emit(&SyncEvent {
                                phase: RunPhase::Downloading,
                                status: "RUNNING".to_string(),
                                counts,
                                duration_ms: ctx.duration_ms(),
                                errors: Vec::new(),
                                progress: Some(snapshot),
                            })
                            .await;
                    }
                }
            }
        };
        let (outcomes, ()) = tokio::join!(worker.run(plan.candidates, &hash_store, tx), consume);

        let counts = OutcomeCounts::from_outcomes(&outcomes);
        let mut state = RunState::classify(&counts, self.config.sync.partial_failure_threshold);
        for outcome in outcomes.iter().filter(|o| o.is_failed()) {
            if let Some(reason) = outcome.failure() {
                ctx.errors.push(format!("{}: {reason}", outcome.key));
            }
        }
        ctx.enter(RunPhase::Terminal);
        tracing::info!(
            state = state.as_str(),
            uploaded = counts.uploaded,
            failed = counts.failed,
            skipped = counts.skipped,
            "downloads finished"
        );

        if !delta.is_empty() || needs_rewrite {
            if let Err(message) = self.commit(&hash_store, &mut handle, &delta, &mut ctx).await {
                ctx.errors.push(message);
                state = RunState::Failed;
            }
        }
        ctx.enter(RunPhase::Committed);

        let ledger_entries = handle.ledger().len();
        self.finish(ctx, state, outcomes, Some(summary), ledger_entries, false)
            .await
    }

    async fn commit(
        &self,
        hash_store: &HashStore,
        handle: &mut LedgerHandle,
        delta: &LedgerDelta,
        ctx: &mut RunContext,
    ) -> Result<(), String> {
        match hash_store
            .commit(handle, delta, OffsetDateTime::now_utc())
            .await
        {
            Ok(report) => {
                ctx.commit_attempts += report.attempts;
                Ok(())
            }
            Err(e) => {
                ctx.commit_attempts += self.config.ledger.commit_attempts;
                tracing::error!(error = %e, "ledger commit failed");
                Err(e.to_string())
            }
        }
    }

    async fn finish(
        &self,
        mut ctx: RunContext,
        state: RunState,
        outcomes: Vec<ItemOutcome>,
        plan: Option<PlanSummary>,
        ledger_entries: usize,
        dry_run: bool,
    ) -> RunReport {
        let counts = OutcomeCounts::from_outcomes(&outcomes);
        let total_bytes = outcomes
            .iter()
            .filter(|o| o.is_uploaded())
            .map(|o| o.bytes_transferred)
            .sum();

        self.notifier
            .emit(&SyncEvent {
                phase: RunPhase::Committed,
                status: state.as_str().to_string(),
                counts,
                duration_ms: ctx.duration_ms(),
                errors: ctx.errors.clone(),
                progress: None,
            })
            .await;
        ctx.enter(RunPhase::Notified);

        let duration = ctx.started.elapsed();
        metrics::RUNS_TOTAL.with_label_values(&[state.as_str()]).inc();
        metrics::RUN_DURATION.observe(duration.as_secs_f64());
        ctx.enter(RunPhase::Done);

        tracing::info!(
            state = state.as_str(),
            uploaded = counts.uploaded,
            failed = counts.failed,
            skipped = counts.skipped,
            bytes = %format_size(total_bytes),
            duration = %format_duration(duration),
            "sync run done"
        );

        RunReport {
            result: RunResult {
                state,
                counts,
                total_bytes,
                duration,
            },
            phases: ctx.phases,
            plan,
            warnings: ctx.warnings,
            errors: ctx.errors,
            outcomes,
            ledger_entries,
            commit_attempts: ctx.commit_attempts,
            dry_run,
        }
    }
}
