//! Bottle identity and catalog records.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::Date;

/// File suffix of every mirrored bottle artifact.
pub const BOTTLE_SUFFIX: &str = ".bottle.tar.gz";

/// Identity of one bottle: formula, version and platform.
///
/// The ledger key is `"{formula}-{version}-{platform}"`. Formula names may contain
/// dashes (`bash-completion`), so parsing splits on the last two dashes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BottleKey {
    formula: String,
    version: String,
    platform: String,
}

impl BottleKey {
    /// Create a key from components, validating each one.
    pub fn new(
        formula: impl Into<String>,
        version: impl Into<String>,
        platform: impl Into<String>,
    ) -> crate::Result<Self> {
        let formula = formula.into();
        let version = version.into();
        let platform = platform.into();

        if formula.is_empty() {
            return Err(crate::Error::InvalidBottleKey(
                "formula name cannot be empty".to_string(),
            ));
        }
        if let Some(c) = formula
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '+' | '@'))
        {
            return Err(crate::Error::InvalidBottleKey(format!(
                "invalid character in formula name {formula:?}: {c}"
            )));
        }

        if version.is_empty() {
            return Err(crate::Error::InvalidBottleKey(format!(
                "version cannot be empty for {formula}"
            )));
        }
        if let Some(c) = version
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '+' | ','))
        {
            return Err(crate::Error::InvalidBottleKey(format!(
                "invalid character in version {version:?}: {c}"
            )));
        }

        if platform.is_empty()
            || !platform
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
        {
            return Err(crate::Error::InvalidBottleKey(format!(
                "invalid platform tag: {platform:?}"
            )));
        }

        Ok(Self {
            formula,
            version,
            platform,
        })
    }

    /// Parse a ledger key of the form `formula-version-platform`.
    pub fn parse(key: &str) -> crate::Result<Self> {
        let (rest, platform) = key.rsplit_once('-').ok_or_else(|| {
            crate::Error::InvalidBottleKey(format!("missing platform separator: {key}"))
        })?;
        let (formula, version) = rest.rsplit_once('-').ok_or_else(|| {
            crate::Error::InvalidBottleKey(format!("missing version separator: {key}"))
        })?;
        Self::new(formula, version, platform)
    }

    /// Recover the identity from an artifact key such as
    /// `2025-07-21/curl-8.2.1.arm64_sonoma.bottle.tar.gz`.
    pub fn from_artifact_key(artifact_key: &str) -> crate::Result<Self> {
        let file_name = artifact_key.rsplit('/').next().unwrap_or(artifact_key);
        let stem = file_name.strip_suffix(BOTTLE_SUFFIX).ok_or_else(|| {
            crate::Error::InvalidBottleKey(format!("not a bottle artifact: {artifact_key}"))
        })?;
        let (name_version, platform) = stem.rsplit_once('.').ok_or_else(|| {
            crate::Error::InvalidBottleKey(format!("missing platform in {artifact_key}"))
        })?;
        let (formula, version) = name_version.rsplit_once('-').ok_or_else(|| {
            crate::Error::InvalidBottleKey(format!("missing version in {artifact_key}"))
        })?;
        Self::new(formula, version, platform)
    }

    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Ledger map key.
    pub fn ledger_key(&self) -> String {
        self.to_string()
    }

    /// Artifact file name: `{formula}-{version}.{platform}.bottle.tar.gz`.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.{}{BOTTLE_SUFFIX}",
            self.formula, self.version, self.platform
        )
    }

    /// Object storage key for an artifact mirrored on `date`.
    pub fn artifact_key(&self, date: Date) -> String {
        format!("{}/{}", crate::format::format_date(date), self.file_name())
    }
}

impl fmt::Debug for BottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BottleKey({self})")
    }
}

impl fmt::Display for BottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.formula, self.version, self.platform)
    }
}

/// One downloadable bottle as advertised by the catalog. Immutable once read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleRecord {
    pub key: BottleKey,
    /// Expected SHA-256 of the payload.
    pub sha256: ContentHash,
    /// Source URL.
    pub url: String,
    /// Expected size in bytes, when the catalog provides one.
    pub size: Option<u64>,
}

impl BottleRecord {
    pub fn new(key: BottleKey, sha256: ContentHash, url: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            key,
            sha256,
            url: url.into(),
            size,
        }
    }

    pub fn ledger_key(&self) -> String {
        self.key.ledger_key()
    }
}
