//! The download worker: fetch, verify, publish.
//!
//! One worker type serves both classes; only the [`WorkerProfile`] ceilings
//! differ. Each candidate is streamed from its source straight into a staged
//! upload while being hashed. The upload is published only when the digest
//! matches the catalog, otherwise it is aborted and nothing becomes visible.

use crate::error::FetchError;
use crate::hash_store::HashStore;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::router::{Candidate, WorkerClass};
use async_trait::async_trait;
use bottlesync_core::config::WorkerProfile;
use bottlesync_core::format::format_date;
use bottlesync_core::{
    BottleKey, BottleRecord, ContentHash, FailureReason, ItemOutcome, ItemStatus,
};
use bottlesync_storage::{ObjectAttributes, ObjectStore, StorageError, StreamingUpload};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use time::Date;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Body of an artifact being fetched.
pub type ArtifactStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Opens artifact downloads.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Start fetching `url`. Resolves once response headers are in.
    async fn open(&self, url: &str) -> Result<ArtifactStream, FetchError>;
}

/// [`ArtifactFetcher`] over HTTPS.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<ArtifactStream, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from_reqwest));
        Ok(Box::pin(body))
    }
}

/// Point-in-time view of a run's progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub bytes: u64,
    pub elapsed_secs: u64,
    /// Remaining time at the average pace so far. Unknown before the first item.
    pub eta_secs: Option<u64>,
}

/// Counts finished items for progress snapshots.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    bytes: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            bytes: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        self.completed += 1;
        if outcome.is_uploaded() {
            self.bytes += outcome.bytes_transferred;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started.elapsed();
        let eta_secs = (self.completed > 0).then(|| {
            let remaining = self.total.saturating_sub(self.completed) as f64;
            (elapsed.as_secs_f64() / self.completed as f64 * remaining).round() as u64
        });
        ProgressSnapshot {
            completed: self.completed,
            total: self.total,
            bytes: self.bytes,
            elapsed_secs: elapsed.as_secs(),
            eta_secs,
        }
    }
}

/// Stream of events from a running worker.
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    /// One candidate reached its final state.
    Outcome(ItemOutcome),
    Progress(ProgressSnapshot),
}

/// Why one attempt did not publish.
#[derive(Debug)]
enum AttemptError {
    Fetch(FetchError),
    Storage(StorageError),
    Mismatch(ContentHash),
    Cancelled,
}

/// Bounded pool that mirrors a plan's candidates.
pub struct DownloadWorker {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    profile: WorkerProfile,
    class: WorkerClass,
    retry: RetryPolicy,
    run_date: Date,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        profile: WorkerProfile,
        class: WorkerClass,
        retry: RetryPolicy,
        run_date: Date,
    ) -> Self {
        Self {
            store,
            fetcher,
            profile,
            class,
            retry,
            run_date,
        }
    }

    pub fn class(&self) -> WorkerClass {
        self.class
    }

    /// Mirror every candidate, at most `max_concurrency` at a time.
    ///
    /// Returns one outcome per candidate. Admission stops `drain_grace` before
    /// the run deadline; whatever is still in flight at the deadline is
    /// cancelled and candidates never admitted fail with
    /// [`FailureReason::DeadlineExceeded`]. Events are best-effort: a closed
    /// receiver does not stop the run.
    pub async fn run(
        &self,
        candidates: Vec<Candidate>,
        hashes: &HashStore,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Vec<ItemOutcome> {
        let total = candidates.len();
        let started = Instant::now();
        let deadline = instant_after(started, self.profile.run_deadline());
        let admission_end = deadline
            .checked_sub(self.profile.drain_grace())
            .unwrap_or(started);
        let cancel = CancellationToken::new();

        tracing::info!(
            worker = self.class.as_str(),
            candidates = total,
            concurrency = self.profile.max_concurrency,
            deadline_secs = self.profile.run_deadline_secs,
            "download worker starting"
        );

        let mut progress = ProgressTracker::new(total);
        let mut pending = candidates.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut outcomes = Vec::with_capacity(total);
        let mut admitting = true;

        let interval = self.profile.progress_interval();
        let mut ticker = tokio::time::interval_at(instant_after(started, interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_sleep);

        loop {
            while admitting && in_flight.len() < self.profile.max_concurrency.max(1) {
                if Instant::now() >= admission_end {
                    tracing::warn!(
                        remaining = pending.len(),
                        "admission closed, draining in-flight items"
                    );
                    admitting = false;
                    break;
                }
                match pending.next() {
                    Some(candidate) => {
                        let span = tracing::info_span!("item", key = %candidate.record.key);
                        in_flight.push(
                            self.process(candidate, hashes, cancel.clone())
                                .instrument(span),
                        );
                    }
                    None => admitting = false,
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(outcome) = in_flight.next() => {
                    progress.record(&outcome);
                    let _ = events.send(WorkerEvent::Outcome(outcome.clone()));
                    outcomes.push(outcome);
                }
                _ = &mut deadline_sleep, if !cancel.is_cancelled() => {
                    tracing::warn!(in_flight = in_flight.len(), "run deadline reached, cancelling");
                    cancel.cancel();
                }
                _ = ticker.tick() => {
                    let snapshot = progress.snapshot();
                    tracing::info!(
                        completed = snapshot.completed,
                        total = snapshot.total,
                        bytes = snapshot.bytes,
                        eta_secs = ?snapshot.eta_secs,
                        "progress"
                    );
                    let _ = events.send(WorkerEvent::Progress(snapshot));
                }
            }
        }
        drop(in_flight);

        for candidate in pending {
            let outcome = ItemOutcome {
                key: candidate.record.key,
                status: ItemStatus::Failed(FailureReason::DeadlineExceeded),
                bytes_transferred: 0,
                attempts: 0,
                elapsed: Duration::ZERO,
            };
            metrics::record_item(FailureReason::DeadlineExceeded.label());
            progress.record(&outcome);
            let _ = events.send(WorkerEvent::Outcome(outcome.clone()));
            outcomes.push(outcome);
        }

        tracing::info!(
            worker = self.class.as_str(),
            items = outcomes.len(),
            elapsed_secs = started.elapsed().as_secs(),
            "download worker finished"
        );
        outcomes
    }

    /// Take one candidate to its final state.
    async fn process(
        &self,
        candidate: Candidate,
        hashes: &HashStore,
        cancel: CancellationToken,
    ) -> ItemOutcome {
        let started = Instant::now();
        let record = candidate.record;

        if hashes.contains(&record.ledger_key()) {
            tracing::debug!("already mirrored, skipping");
            metrics::record_item("skipped");
            return ItemOutcome {
                key: record.key,
                status: ItemStatus::SkippedAlreadyPresent,
                bytes_transferred: 0,
                attempts: 0,
                elapsed: started.elapsed(),
            };
        }

        let storage_key = record.key.artifact_key(self.run_date);
        let mut attempts = 0;
        let mut retries_used = 0;
        let mut mismatches = 0;
        let mut bytes_transferred = 0;

        let status = loop {
            if cancel.is_cancelled() {
                break ItemStatus::Failed(FailureReason::DeadlineExceeded);
            }
            attempts += 1;

            let failure = match self
                .attempt(&record, &storage_key, &cancel, &mut bytes_transferred)
                .await
            {
                Ok((sha256, size)) => {
                    bytes_transferred = size;
                    break ItemStatus::Uploaded {
                        storage_key: storage_key.clone(),
                        sha256,
                    };
                }
                Err(AttemptError::Cancelled) => {
                    break ItemStatus::Failed(FailureReason::DeadlineExceeded);
                }
                Err(AttemptError::Mismatch(actual)) => {
                    metrics::HASH_MISMATCHES.inc();
                    mismatches += 1;
                    let reason = FailureReason::HashMismatch {
                        expected: record.sha256,
                        actual,
                    };
                    if mismatches >= 2 {
                        break ItemStatus::Failed(reason);
                    }
                    tracing::warn!(attempt = attempts, %reason, "digest mismatch, retrying once");
                    continue;
                }
                Err(AttemptError::Fetch(e)) => {
                    if !e.is_retryable() {
                        break ItemStatus::Failed(FailureReason::Network {
                            message: e.to_string(),
                        });
                    }
                    FailureReason::Network {
                        message: e.to_string(),
                    }
                }
                Err(AttemptError::Storage(e)) => FailureReason::Storage {
                    message: e.to_string(),
                },
            };

            if retries_used >= self.retry.retries() {
                break ItemStatus::Failed(failure);
            }
            let delay = self.retry.delay(retries_used);
            retries_used += 1;
            metrics::FETCH_RETRIES.inc();
            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "attempt failed, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break ItemStatus::Failed(FailureReason::DeadlineExceeded),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let elapsed = started.elapsed();
        metrics::ITEM_DURATION.observe(elapsed.as_secs_f64());
        match &status {
            ItemStatus::Uploaded { storage_key, .. } => {
                metrics::record_item("uploaded");
                metrics::BYTES_UPLOADED.inc_by(bytes_transferred);
                tracing::info!(
                    storage_key = %storage_key,
                    bytes = bytes_transferred,
                    attempts,
                    "bottle mirrored"
                );
            }
            ItemStatus::Failed(reason) => {
                metrics::record_item(reason.label());
                tracing::warn!(attempts, %reason, "bottle failed");
            }
            ItemStatus::SkippedAlreadyPresent => metrics::record_item("skipped"),
        }

        ItemOutcome {
            key: record.key,
            status,
            bytes_transferred,
            attempts,
            elapsed,
        }
    }

    /// One fetch-verify-publish attempt under the per-item timeout.
    ///
    /// Returns the verified digest and size of the published artifact.
    async fn attempt(
        &self,
        record: &BottleRecord,
        storage_key: &str,
        cancel: &CancellationToken,
        bytes_transferred: &mut u64,
    ) -> Result<(ContentHash, u64), AttemptError> {
        let timeout = self.profile.per_item_timeout();
        let attempt_deadline = instant_after(Instant::now(), timeout);

        let mut body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            opened = tokio::time::timeout_at(attempt_deadline, self.fetcher.open(&record.url)) => {
                match opened {
                    Ok(Ok(body)) => body,
                    Ok(Err(e)) => return Err(AttemptError::Fetch(e)),
                    Err(_) => return Err(AttemptError::Fetch(FetchError::Timeout(timeout))),
                }
            }
        };

        let mut upload = self
            .store
            .put_stream(storage_key, artifact_attributes(&record.key, &record.sha256, self.run_date))
            .await
            .map_err(AttemptError::Storage)?;
        let mut hasher = ContentHash::hasher();
        let mut size = 0u64;

        let streamed: Result<(), AttemptError> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(AttemptError::Cancelled),
                next = tokio::time::timeout_at(attempt_deadline, body.next()) => next,
            };
            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => break Err(AttemptError::Fetch(e)),
                Ok(None) => break Ok(()),
                Err(_) => break Err(AttemptError::Fetch(FetchError::Timeout(timeout))),
            };
            hasher.update(&chunk);
            size += chunk.len() as u64;
            *bytes_transferred += chunk.len() as u64;
            if let Err(e) = upload.write(chunk).await {
                break Err(AttemptError::Storage(e));
            }
        };

        if let Err(e) = streamed {
            discard(upload, storage_key).await;
            return Err(e);
        }

        let actual = hasher.finalize();
        if actual != record.sha256 {
            discard(upload, storage_key).await;
            return Err(AttemptError::Mismatch(actual));
        }

        // Publishing counts against the attempt budget and stops at the run deadline.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            finished = tokio::time::timeout_at(attempt_deadline, upload.finish()) => match finished {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(AttemptError::Storage(e)),
                Err(_) => {
                    return Err(AttemptError::Storage(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("publishing {storage_key} exceeded {}s", timeout.as_secs()),
                    ))));
                }
            },
        }
        Ok((actual, size))
    }
}

/// `start + after`, saturating to about thirty years out instead of overflowing.
fn instant_after(start: Instant, after: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Integrity metadata stored alongside each artifact.
pub fn artifact_attributes(key: &BottleKey, sha256: &ContentHash, run_date: Date) -> ObjectAttributes {
    ObjectAttributes::default()
        .with_content_type("application/gzip")
        .with_metadata("sha256", sha256.to_hex())
        .with_metadata("formula", key.formula())
        .with_metadata("version", key.version())
        .with_metadata("platform", key.platform())
        .with_metadata("sync-date", format_date(run_date))
}

async fn discard(upload: Box<dyn StreamingUpload>, storage_key: &str) {
    if let Err(e) = upload.abort().await {
        tracing::warn!(storage_key, error = %e, "failed to abort staged upload");
    }
}
