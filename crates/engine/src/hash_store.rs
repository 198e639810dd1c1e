//! The dedup ledger: load, validate, merge and publish.
//!
//! The ledger is one JSON document in object storage. Writers never lock it.
//! Each commit is a conditional write against the version that was read; the
//! loser of a race reloads, re-applies its own pending entries on top of the
//! winner's document and tries again.

use crate::error::LedgerCommitError;
use crate::metrics;
use bottlesync_core::config::LedgerConfig;
use bottlesync_core::format::{backup_stamp, parse_date};
use bottlesync_core::ledger::DroppedEntry;
use bottlesync_core::{BottleKey, ContentHash, HashLedger, LedgerEntry, MergeSummary, bottle::BOTTLE_SUFFIX};
use bottlesync_storage::{ObjectStore, ObjectVersion, PutCondition, StorageError};
use bytes::Bytes;
use dashmap::DashSet;
use std::sync::Arc;
use time::{Date, OffsetDateTime};
use tracing::instrument;

/// Where the loaded ledger came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerSource {
    /// The stored document parsed.
    Stored,
    /// No document existed yet.
    Missing,
    /// The document could not be read; the run starts empty.
    Unreadable { error: String },
    /// The document was corrupt; the run starts empty or rebuilt.
    Recovered {
        backup_key: Option<String>,
        rebuilt: bool,
    },
    /// The document was corrupt and was left in place ([`LoadMode::ReadOnly`]).
    Corrupt { error: String, rebuilt: bool },
}

/// How [`HashStore::load_with_mode`] treats a corrupt document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Back up the corrupt document before it gets replaced.
    #[default]
    Recover,
    /// Never write to storage. Dry runs use this.
    ReadOnly,
}

/// A ledger together with the stored version it was derived from.
///
/// The version is the precondition of the next commit. `None` means no
/// document existed when this handle was loaded.
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    ledger: HashLedger,
    version: Option<ObjectVersion>,
}

impl LedgerHandle {
    pub fn ledger(&self) -> &HashLedger {
        &self.ledger
    }

    pub fn version(&self) -> Option<&ObjectVersion> {
        self.version.as_ref()
    }
}

/// Result of [`HashStore::load`].
#[derive(Debug)]
pub struct LoadedLedger {
    pub handle: LedgerHandle,
    /// Entries repaired during validation.
    pub migrated: usize,
    /// Entries discarded during validation.
    pub dropped: Vec<DroppedEntry>,
    pub source: LedgerSource,
}

impl LoadedLedger {
    /// Entries that needed migration or were dropped.
    pub fn fallback_count(&self) -> usize {
        self.migrated + self.dropped.len()
    }

    /// Whether the stored document differs from its normalized form.
    pub fn needs_rewrite(&self) -> bool {
        self.fallback_count() > 0 || matches!(self.source, LedgerSource::Recovered { .. })
    }
}

/// Entries this run wants in the ledger, re-applied on every commit attempt.
#[derive(Clone, Debug, Default)]
pub struct LedgerDelta {
    entries: Vec<LedgerEntry>,
}

impl LedgerDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = LedgerEntry>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReport {
    /// Conditional writes attempted, including the successful one.
    pub attempts: u32,
    /// Entries in the published ledger.
    pub entries: usize,
    pub version: ObjectVersion,
}

/// Owner of the ledger document and the in-process membership index.
pub struct HashStore {
    store: Arc<dyn ObjectStore>,
    config: LedgerConfig,
    index: DashSet<String>,
}

impl HashStore {
    pub fn new(store: Arc<dyn ObjectStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            index: DashSet::new(),
        }
    }

    pub fn ledger_key(&self) -> &str {
        &self.config.key
    }

    /// O(1) membership test against every key this process knows is mirrored.
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    fn refresh_index(&self, ledger: &HashLedger) {
        for key in ledger.keys() {
            if !self.index.contains(key) {
                self.index.insert(key.to_string());
            }
        }
    }

    fn backup_key(&self, now: OffsetDateTime) -> String {
        let file_name = self.config.key.rsplit('/').next().unwrap_or(&self.config.key);
        let stem = file_name.strip_suffix(".json").unwrap_or(file_name);
        format!(
            "{}/{stem}_{}.json",
            self.config.backup_prefix.trim_end_matches('/'),
            backup_stamp(now)
        )
    }

    async fn backup_current(&self, now: OffsetDateTime) -> Result<String, StorageError> {
        let backup_key = self.backup_key(now);
        self.store.copy(&self.config.key, &backup_key).await?;
        Ok(backup_key)
    }

    /// Read the primary ledger. Never fails: a missing, unreadable or corrupt
    /// document yields an empty (or rebuilt) ledger and a logged warning.
    pub async fn load(&self, today: Date, now: OffsetDateTime) -> LoadedLedger {
        self.load_with_mode(today, now, LoadMode::Recover).await
    }

    /// [`HashStore::load`] with an explicit treatment of corrupt documents.
    ///
    /// In [`LoadMode::ReadOnly`] a corrupt document is neither backed up nor
    /// counted as a recovery; artifacts are still scanned (reads only) when
    /// `rebuild_on_corruption` is set.
    #[instrument(skip(self), fields(key = %self.config.key))]
    pub async fn load_with_mode(&self, today: Date, now: OffsetDateTime, mode: LoadMode) -> LoadedLedger {
        let loaded = self.load_inner(today, now, mode).await;

        if !loaded.dropped.is_empty() {
            metrics::LEDGER_ENTRIES_DROPPED.inc_by(loaded.dropped.len() as u64);
        }
        self.refresh_index(&loaded.handle.ledger);
        tracing::info!(
            entries = loaded.handle.ledger.len(),
            migrated = loaded.migrated,
            dropped = loaded.dropped.len(),
            source = ?loaded.source,
            "ledger loaded"
        );
        loaded
    }

    async fn load_inner(&self, today: Date, now: OffsetDateTime, mode: LoadMode) -> LoadedLedger {
        let object = match self.store.get_versioned(&self.config.key).await {
            Ok(object) => object,
            Err(StorageError::NotFound(_)) => {
                tracing::info!("no ledger document yet, starting empty");
                return LoadedLedger {
                    handle: LedgerHandle {
                        ledger: HashLedger::empty(now),
                        version: None,
                    },
                    migrated: 0,
                    dropped: Vec::new(),
                    source: LedgerSource::Missing,
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "ledger unreadable, starting empty");
                metrics::LEDGER_RECOVERIES.inc();
                return LoadedLedger {
                    handle: LedgerHandle {
                        ledger: HashLedger::empty(now),
                        version: None,
                    },
                    migrated: 0,
                    dropped: Vec::new(),
                    source: LedgerSource::Unreadable {
                        error: e.to_string(),
                    },
                };
            }
        };

        match HashLedger::parse(&object.data, today, now) {
            Ok(parsed) => LoadedLedger {
                handle: LedgerHandle {
                    ledger: parsed.ledger,
                    version: Some(object.version),
                },
                migrated: parsed.migrated,
                dropped: parsed.dropped,
                source: LedgerSource::Stored,
            },
            Err(e) => {
                let backup_key = match mode {
                    LoadMode::ReadOnly => {
                        tracing::warn!(error = %e, "ledger document corrupt, leaving it in place");
                        None
                    }
                    LoadMode::Recover => {
                        tracing::warn!(error = %e, "ledger document corrupt, replacing it");
                        metrics::LEDGER_RECOVERIES.inc();
                        match self.backup_current(now).await {
                            Ok(key) => {
                                tracing::info!(backup = %key, "corrupt ledger backed up");
                                Some(key)
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "could not back up corrupt ledger");
                                None
                            }
                        }
                    }
                };

                let mut rebuilt = false;
                let ledger = if self.config.rebuild_on_corruption {
                    match self.rebuild_from_artifacts(today, now).await {
                        Ok(ledger) => {
                            rebuilt = true;
                            ledger
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "ledger rebuild failed, starting empty");
                            HashLedger::empty(now)
                        }
                    }
                } else {
                    HashLedger::empty(now)
                };

                LoadedLedger {
                    handle: LedgerHandle {
                        ledger,
                        // Overwrite the corrupt document, but only if nobody replaced it meanwhile.
                        version: Some(object.version),
                    },
                    migrated: 0,
                    dropped: Vec::new(),
                    source: match mode {
                        LoadMode::Recover => LedgerSource::Recovered {
                            backup_key,
                            rebuilt,
                        },
                        LoadMode::ReadOnly => LedgerSource::Corrupt {
                            error: e.to_string(),
                            rebuilt,
                        },
                    },
                }
            }
        }
    }

    /// Merge a supplementary ledger into `handle`, recording its entries in
    /// `delta` so they survive a commit conflict. Incoming entries win.
    pub fn merge(
        &self,
        handle: &mut LedgerHandle,
        delta: &mut LedgerDelta,
        incoming: HashLedger,
        now: OffsetDateTime,
    ) -> MergeSummary {
        delta.extend(incoming.entries().cloned());
        let summary = handle.ledger.merge(incoming, now);
        self.refresh_index(&handle.ledger);
        tracing::info!(
            added = summary.added,
            overwritten = summary.overwritten,
            "external hash source merged"
        );
        summary
    }

    /// Publish `handle`'s ledger plus `delta` with optimistic concurrency.
    ///
    /// On success `handle` holds the published ledger and its new version.
    /// `delta` is left untouched; callers clear it once it is durable.
    #[instrument(skip(self, handle, delta), fields(key = %self.config.key, pending = delta.len()))]
    pub async fn commit(
        &self,
        handle: &mut LedgerHandle,
        delta: &LedgerDelta,
        now: OffsetDateTime,
    ) -> Result<CommitReport, LedgerCommitError> {
        let max_attempts = self.config.commit_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut candidate = handle.ledger.clone();
            candidate.upsert_all(delta.entries());
            candidate.touch(now);
            let body = Bytes::from(candidate.to_json_vec()?);

            let staging_key = format!("{}.staging-{}", self.config.key, uuid::Uuid::new_v4());
            self.store.put(&staging_key, body.clone()).await?;

            if self.config.backup_on_commit && handle.version.is_some() {
                match self.backup_current(now).await {
                    Ok(key) => tracing::debug!(backup = %key, "ledger backed up before commit"),
                    Err(e) => tracing::warn!(error = %e, "ledger backup before commit failed"),
                }
            }

            let condition = match &handle.version {
                Some(version) => PutCondition::IfMatch(version.clone()),
                None => PutCondition::IfAbsent,
            };
            let published = self
                .store
                .put_conditional(&self.config.key, body, condition)
                .await;

            if let Err(e) = self.store.delete(&staging_key).await {
                tracing::warn!(staging = %staging_key, error = %e, "failed to remove staging ledger");
            }

            match published {
                Ok(version) => {
                    self.refresh_index(&candidate);
                    metrics::LEDGER_COMMITS.inc();
                    metrics::LEDGER_ENTRIES.set(candidate.len() as i64);
                    let report = CommitReport {
                        attempts: attempt,
                        entries: candidate.len(),
                        version: version.clone(),
                    };
                    handle.ledger = candidate;
                    handle.version = Some(version);
                    tracing::info!(attempts = attempt, entries = report.entries, "ledger committed");
                    return Ok(report);
                }
                Err(e) if e.is_precondition_failed() => {
                    metrics::LEDGER_COMMIT_CONFLICTS.inc();
                    if attempt >= max_attempts {
                        tracing::error!(attempts = attempt, "ledger commit abandoned after repeated conflicts");
                        return Err(LedgerCommitError::Conflict { attempts: attempt });
                    }
                    tracing::warn!(attempt, "ledger changed since it was read, reloading");
                    tokio::time::sleep(self.config.commit_backoff().saturating_mul(attempt)).await;
                    self.reload(handle, now).await?;
                }
                Err(e) => return Err(LedgerCommitError::Storage(e)),
            }
        }
    }

    /// Replace `handle` with the latest stored document.
    async fn reload(&self, handle: &mut LedgerHandle, now: OffsetDateTime) -> Result<(), LedgerCommitError> {
        let today = now.date();
        match self.store.get_versioned(&self.config.key).await {
            Ok(object) => {
                let ledger = match HashLedger::parse(&object.data, today, now) {
                    Ok(parsed) => parsed.ledger,
                    Err(e) => {
                        // Another writer left a corrupt document; keep what we
                        // have and overwrite it at the version we just saw.
                        tracing::warn!(error = %e, "latest ledger corrupt, keeping local copy");
                        handle.ledger.clone()
                    }
                };
                self.refresh_index(&ledger);
                handle.ledger = ledger;
                handle.version = Some(object.version);
                Ok(())
            }
            Err(StorageError::NotFound(_)) => {
                handle.version = None;
                Ok(())
            }
            Err(e) => Err(LedgerCommitError::Storage(e)),
        }
    }

    /// Reconstruct a ledger from the integrity metadata of mirrored artifacts.
    ///
    /// Artifacts without a valid `sha256` metadata value are skipped.
    #[instrument(skip(self))]
    pub async fn rebuild_from_artifacts(
        &self,
        today: Date,
        now: OffsetDateTime,
    ) -> Result<HashLedger, StorageError> {
        let backup_prefix = format!("{}/", self.config.backup_prefix.trim_end_matches('/'));
        let mut ledger = HashLedger::empty(now);
        let mut skipped = 0usize;

        for artifact_key in self.store.list("").await? {
            if !artifact_key.ends_with(BOTTLE_SUFFIX) || artifact_key.starts_with(&backup_prefix) {
                continue;
            }
            let Ok(key) = BottleKey::from_artifact_key(&artifact_key) else {
                skipped += 1;
                continue;
            };
            let meta = self.store.head(&artifact_key).await?;
            let Some(sha256) = meta
                .metadata
                .get("sha256")
                .and_then(|hex| ContentHash::from_hex(hex).ok())
            else {
                tracing::debug!(artifact = %artifact_key, "no usable sha256 metadata, skipping");
                skipped += 1;
                continue;
            };
            let download_date = meta
                .metadata
                .get("sync-date")
                .map(String::as_str)
                .or_else(|| artifact_key.split('/').next())
                .and_then(|raw| parse_date(raw).ok())
                .filter(|date| *date <= today)
                .unwrap_or(today);

            let entry = LedgerEntry {
                key,
                sha256,
                file_size: meta.size,
                download_date,
                storage_key: Some(artifact_key),
            };
            // A formula mirrored on several dates keeps its most recent copy.
            let newer = ledger
                .get(&entry.ledger_key())
                .is_none_or(|existing| existing.download_date <= entry.download_date);
            if newer {
                ledger.upsert(entry);
            }
        }

        tracing::info!(entries = ledger.len(), skipped, "ledger rebuilt from artifacts");
        Ok(ledger)
    }
}
