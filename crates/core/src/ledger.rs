//! The dedup ledger: a versioned JSON document mapping bottle identity to the
//! verified content hash of its mirrored artifact.
//!
//! Wire format:
//!
//! ```json
//! {
//!   "last_updated": "2025-07-21T10:30:00Z",
//!   "bottles": {
//!     "curl-8.2.1-arm64_sonoma": {
//!       "sha256": "<64 hex>",
//!       "download_date": "2025-07-21",
//!       "file_size": 1000000
//!     }
//!   },
//!   "statistics": { "total_bottles": 1, "total_size": 1000000, "platforms": { ... } }
//! }
//! ```
//!
//! Parsing is lenient per entry: malformed entries are dropped (or repaired where
//! a safe default exists) and counted, so a partially damaged document still
//! yields a usable ledger. Only a document that is not a JSON object at all is
//! reported as corrupt.

use crate::bottle::BottleKey;
use crate::format::{format_date, format_timestamp, parse_date, parse_timestamp};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use time::{Date, OffsetDateTime};

/// Upper bound on a plausible bottle size (10 GiB).
pub const MAX_PLAUSIBLE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// A persisted record of one verified, mirrored bottle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: BottleKey,
    pub sha256: ContentHash,
    pub file_size: u64,
    pub download_date: Date,
    /// Object key of the mirrored artifact, when known.
    pub storage_key: Option<String>,
}

impl LedgerEntry {
    pub fn ledger_key(&self) -> String {
        self.key.ledger_key()
    }
}

/// Per-platform size statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStats {
    pub count: u64,
    pub total_size: u64,
    pub mean_size: u64,
}

/// Aggregate statistics derived from ledger entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_bottles: u64,
    pub total_size: u64,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformStats>,
}

impl LedgerStatistics {
    /// Compute statistics over a set of entries.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total_bottles += 1;
            stats.total_size = stats.total_size.saturating_add(entry.file_size);
            let platform = stats
                .platforms
                .entry(entry.key.platform().to_string())
                .or_default();
            platform.count += 1;
            platform.total_size = platform.total_size.saturating_add(entry.file_size);
        }
        for platform in stats.platforms.values_mut() {
            platform.mean_size = platform.total_size / platform.count.max(1);
        }
        stats
    }

    /// Mean artifact size for `platform`, if any entries exist for it.
    pub fn platform_mean(&self, platform: &str) -> Option<u64> {
        self.platforms
            .get(platform)
            .filter(|p| p.count > 0)
            .map(|p| p.mean_size)
    }

    /// Mean artifact size across every platform.
    pub fn global_mean(&self) -> Option<u64> {
        (self.total_bottles > 0).then(|| self.total_size / self.total_bottles)
    }
}

/// Why an entry was dropped during load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DroppedEntry {
    pub key: String,
    pub reason: String,
}

/// Result of parsing a ledger document.
#[derive(Debug)]
pub struct ParsedLedger {
    pub ledger: HashLedger,
    /// Entries kept after repairing a field (uppercase digest, missing date, ...).
    pub migrated: usize,
    /// Entries discarded because they could not be repaired.
    pub dropped: Vec<DroppedEntry>,
}

impl ParsedLedger {
    /// Total number of entries that needed migration or were dropped.
    pub fn fallback_count(&self) -> usize {
        self.migrated + self.dropped.len()
    }
}

/// Outcome of merging one ledger into another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub overwritten: usize,
}

/// In-memory ledger document.
#[derive(Clone, Debug)]
pub struct HashLedger {
    last_updated: OffsetDateTime,
    entries: HashMap<String, LedgerEntry>,
    statistics: Option<LedgerStatistics>,
}

impl PartialEq for HashLedger {
    fn eq(&self, other: &Self) -> bool {
        self.last_updated == other.last_updated && self.entries == other.entries
    }
}

impl HashLedger {
    /// An empty ledger stamped with `now`.
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            last_updated: now,
            entries: HashMap::new(),
            statistics: None,
        }
    }

    pub fn last_updated(&self) -> OffsetDateTime {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Aggregate statistics, present whenever the ledger has entries.
    pub fn statistics(&self) -> Option<&LedgerStatistics> {
        self.statistics.as_ref()
    }

    /// Insert or replace an entry. Returns the replaced entry, if any.
    pub fn upsert(&mut self, entry: LedgerEntry) -> Option<LedgerEntry> {
        let previous = self.entries.insert(entry.ledger_key(), entry);
        self.refresh_statistics();
        previous
    }

    /// Insert or replace a batch of entries, in order.
    pub fn upsert_all<'a>(&mut self, entries: impl IntoIterator<Item = &'a LedgerEntry>) -> usize {
        let mut applied = 0;
        for entry in entries {
            self.entries.insert(entry.ledger_key(), entry.clone());
            applied += 1;
        }
        self.refresh_statistics();
        applied
    }

    /// Merge `incoming` into this ledger. Incoming entries win on key collision.
    ///
    /// `last_updated` moves to `now` but never backwards.
    pub fn merge(&mut self, incoming: HashLedger, now: OffsetDateTime) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for (key, entry) in incoming.entries {
            if self.entries.insert(key, entry).is_some() {
                summary.overwritten += 1;
            } else {
                summary.added += 1;
            }
        }
        self.touch(now);
        self.refresh_statistics();
        summary
    }

    /// Advance `last_updated` to `now` unless it is already later.
    pub fn touch(&mut self, now: OffsetDateTime) {
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    fn refresh_statistics(&mut self) {
        self.statistics = if self.entries.is_empty() {
            None
        } else {
            Some(LedgerStatistics::from_entries(self.entries.values()))
        };
    }

    /// Parse a ledger document, validating and migrating each entry.
    ///
    /// `today` is substituted for missing download dates and caps future ones;
    /// `now` stands in for a missing or unreadable `last_updated`.
    pub fn parse(data: &[u8], today: Date, now: OffsetDateTime) -> crate::Result<ParsedLedger> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| crate::Error::CorruptLedger(format!("invalid JSON: {e}")))?;
        let Value::Object(mut root) = value else {
            return Err(crate::Error::CorruptLedger(
                "top-level value is not an object".to_string(),
            ));
        };

        let mut migrated = 0;
        let last_updated = match root.get("last_updated").and_then(Value::as_str) {
            Some(raw) => match parse_timestamp(raw) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::warn!(error = %e, "ledger last_updated unreadable, using current time");
                    now
                }
            },
            None => {
                tracing::warn!("ledger has no last_updated, using current time");
                now
            }
        };

        let bottles = match root.remove("bottles") {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(crate::Error::CorruptLedger(format!(
                    "'bottles' must be an object, found {}",
                    json_type(&other)
                )));
            }
            None => {
                tracing::warn!("ledger has no 'bottles' field, treating as empty");
                Map::new()
            }
        };

        let mut entries = HashMap::with_capacity(bottles.len());
        let mut dropped = Vec::new();
        for (raw_key, raw_entry) in bottles {
            match parse_entry(&raw_key, raw_entry, today) {
                Ok((entry, repaired)) => {
                    if repaired {
                        migrated += 1;
                    }
                    entries.insert(entry.ledger_key(), entry);
                }
                Err(reason) => {
                    tracing::warn!(key = %raw_key, reason = %reason, "dropping invalid ledger entry");
                    dropped.push(DroppedEntry {
                        key: raw_key,
                        reason,
                    });
                }
            }
        }

        let mut ledger = Self {
            last_updated,
            entries,
            statistics: None,
        };
        ledger.refresh_statistics();

        Ok(ParsedLedger {
            ledger,
            migrated,
            dropped,
        })
    }

    /// Serialize to the JSON wire format with keys in sorted order.
    pub fn to_json_vec(&self) -> crate::Result<Vec<u8>> {
        let document = LedgerDocument {
            last_updated: format_timestamp(self.last_updated),
            bottles: self
                .entries
                .iter()
                .map(|(key, entry)| {
                    (
                        key.as_str(),
                        EntryDocument {
                            sha256: entry.sha256.to_hex(),
                            download_date: format_date(entry.download_date),
                            file_size: entry.file_size,
                            storage_key: entry.storage_key.as_deref(),
                        },
                    )
                })
                .collect(),
            statistics: self.statistics.as_ref(),
        };
        serde_json::to_vec_pretty(&document).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

#[derive(Serialize)]
struct LedgerDocument<'a> {
    last_updated: String,
    bottles: BTreeMap<&'a str, EntryDocument<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    statistics: Option<&'a LedgerStatistics>,
}

#[derive(Serialize)]
struct EntryDocument<'a> {
    sha256: String,
    download_date: String,
    file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_key: Option<&'a str>,
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate one raw entry. Returns the entry and whether any field was repaired.
fn parse_entry(raw_key: &str, raw: Value, today: Date) -> Result<(LedgerEntry, bool), String> {
    let fields = match raw {
        Value::Object(fields) => fields,
        other => return Err(format!("entry is a {}, expected an object", json_type(&other))),
    };
    let key = BottleKey::parse(raw_key).map_err(|e| e.to_string())?;
    let mut repaired = false;

    let sha256 = match fields.get("sha256") {
        Some(Value::String(hex)) => {
            let hash = ContentHash::from_hex(hex).map_err(|e| e.to_string())?;
            if !ContentHash::is_canonical_hex(hex) {
                repaired = true;
            }
            hash
        }
        Some(other) => return Err(format!("sha256 is a {}", json_type(other))),
        None => return Err("missing sha256".to_string()),
    };

    let file_size = match fields.get("file_size") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(size) if size <= MAX_PLAUSIBLE_SIZE => size,
            Some(size) => return Err(format!("implausible file_size {size}")),
            None => return Err(format!("file_size {n} is not a non-negative integer")),
        },
        Some(other) => return Err(format!("file_size is a {}", json_type(other))),
        None => {
            repaired = true;
            0
        }
    };

    let download_date = match fields.get("download_date").and_then(Value::as_str) {
        Some(raw_date) => match parse_date(raw_date) {
            Ok(date) if date > today => {
                repaired = true;
                today
            }
            Ok(date) => date,
            Err(_) => {
                repaired = true;
                today
            }
        },
        None => {
            repaired = true;
            today
        }
    };

    let storage_key = fields
        .get("storage_key")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok((
        LedgerEntry {
            key,
            sha256,
            file_size,
            download_date,
            storage_key,
        },
        repaired,
    ))
}
