//! # Normalized Entities
//!
//! The uniform representation every snapshot record is converted into before
//! classification, plus the content fingerprint used as the primary truth
//! signal for change detection.

use crate::dedup::ContentKey;
use bridge_traits::{EntityKind, RawRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Which side of a sync pair a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Fingerprint
// ============================================================================

/// Content-derived equality key for an entity
///
/// `digest` is a SHA-256 over the canonical form of the sync-relevant fields;
/// `fields` keeps one digest per field so the resolver can measure how far a
/// side moved from its baseline. Two fingerprints are equal when their
/// digests are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: String,
    pub fields: BTreeMap<String, String>,
}

impl Fingerprint {
    /// Build a fingerprint from named field values.
    ///
    /// Field order is irrelevant; the map is sorted before hashing.
    pub fn from_fields(kind: EntityKind, values: BTreeMap<&str, Value>) -> Self {
        let fields: BTreeMap<String, String> = values
            .into_iter()
            .map(|(name, value)| (name.to_string(), hex_digest(value.to_string().as_bytes())))
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        for (name, digest) in &fields {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(digest.as_bytes());
        }

        Self {
            digest: format!("{:x}", hasher.finalize()),
            fields,
        }
    }

    /// Number of fields whose digest differs from `baseline`
    ///
    /// Fields present on only one side count as differing.
    pub fn divergence(&self, baseline: &Fingerprint) -> usize {
        let names: BTreeSet<&String> = self.fields.keys().chain(baseline.fields.keys()).collect();
        names
            .into_iter()
            .filter(|name| self.fields.get(*name) != baseline.fields.get(*name))
            .count()
    }

    /// Abbreviated digest for log lines
    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Normalized entity
// ============================================================================

/// One record from either side, in the form the classifier works on
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntity {
    /// Source-side identifier (local id or remote id depending on `side`)
    pub id: String,
    pub side: Side,
    pub kind: EntityKind,
    pub fingerprint: Fingerprint,
    /// Source-reported modification time; may be absent or imprecise
    pub modified_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    /// Content identity for asset kinds
    pub content_key: Option<ContentKey>,
    /// Original record, handed back to the other side's adapter on apply
    pub payload: RawRecord,
}

impl NormalizedEntity {
    /// Present and not tombstoned
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}
