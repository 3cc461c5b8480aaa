//! # Identity Mapping
//!
//! Durable links between local and remote identities and the in-memory index
//! over them.
//!
//! ## Overview
//!
//! A [`MappingRecord`] ties one local id to one remote id together with the
//! fingerprints each side had the last time the two were known to be
//! consistent. A record with only one id set is *pending creation*: the
//! engine wrote it just before asking the other side to create a copy.
//!
//! The [`MappingIndex`] provides O(1) lookup by either id and by content key,
//! and enforces the one-to-one invariant: no live local id may point at two
//! remote ids, and vice versa. Retired (tombstoned) records stay indexed
//! separately so a stale cached listing cannot resurrect a deleted pair.

use crate::dedup::{ContentKey, DedupIndex};
use crate::entity::{Fingerprint, Side};
use crate::error::{Result, SyncError};
use bridge_traits::{EntityKind, SyncDirection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a mapping record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingId(Uuid);

impl MappingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::Database(format!("Invalid mapping id {}: {}", s, e)))
    }
}

impl Default for MappingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable link between a local and a remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    pub id: MappingId,
    pub kind: EntityKind,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    /// Local fingerprint when the pair was last known consistent
    pub last_local_fingerprint: Option<Fingerprint>,
    /// Remote fingerprint when the pair was last known consistent
    pub last_remote_fingerprint: Option<Fingerprint>,
    /// Local stamp recorded at the last sync (source clock)
    pub last_local_modified_at: Option<DateTime<Utc>>,
    /// Remote stamp recorded at the last sync (source clock)
    pub last_remote_modified_at: Option<DateTime<Utc>>,
    /// Engine clock; never compared with source stamps
    pub last_synced_at: DateTime<Utc>,
    pub direction_hint: Option<SyncDirection>,
    pub content_key: Option<ContentKey>,
    /// Consecutive conflict resolutions committed for this pair
    pub conflict_streak: u32,
    pub tombstoned: bool,
}

impl MappingRecord {
    /// One-sided record written before asking `side`'s counterpart to create
    /// a copy of the entity `id`
    pub fn pending(kind: EntityKind, side: Side, id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        let (local_id, remote_id) = match side {
            Side::Local => (Some(id), None),
            Side::Remote => (None, Some(id)),
        };

        Self {
            id: MappingId::new(),
            kind,
            local_id,
            remote_id,
            last_local_fingerprint: None,
            last_remote_fingerprint: None,
            last_local_modified_at: None,
            last_remote_modified_at: None,
            last_synced_at: now,
            direction_hint: None,
            content_key: None,
            conflict_streak: 0,
            tombstoned: false,
        }
    }

    /// Both ids known
    pub fn is_paired(&self) -> bool {
        self.local_id.is_some() && self.remote_id.is_some()
    }

    /// Only one side exists yet
    pub fn is_pending(&self) -> bool {
        self.local_id.is_some() != self.remote_id.is_some()
    }

    pub fn id_on(&self, side: Side) -> Option<&str> {
        match side {
            Side::Local => self.local_id.as_deref(),
            Side::Remote => self.remote_id.as_deref(),
        }
    }

    pub fn last_fingerprint(&self, side: Side) -> Option<&Fingerprint> {
        match side {
            Side::Local => self.last_local_fingerprint.as_ref(),
            Side::Remote => self.last_remote_fingerprint.as_ref(),
        }
    }

    pub fn last_modified_at(&self, side: Side) -> Option<DateTime<Utc>> {
        match side {
            Side::Local => self.last_local_modified_at,
            Side::Remote => self.last_remote_modified_at,
        }
    }

    /// Record that `side` holds entity `id` with `fingerprint`, consistent
    /// with the other side as of this commit
    pub fn observe(
        &mut self,
        side: Side,
        id: impl Into<String>,
        fingerprint: Fingerprint,
        modified_at: Option<DateTime<Utc>>,
    ) {
        let id = Some(id.into());
        match side {
            Side::Local => {
                self.local_id = id;
                self.last_local_fingerprint = Some(fingerprint);
                self.last_local_modified_at = modified_at;
            }
            Side::Remote => {
                self.remote_id = id;
                self.last_remote_fingerprint = Some(fingerprint);
                self.last_remote_modified_at = modified_at;
            }
        }
    }

    pub fn with_direction_hint(mut self, hint: Option<SyncDirection>) -> Self {
        self.direction_hint = hint;
        self
    }

    pub fn with_content_key(mut self, key: Option<ContentKey>) -> Self {
        self.content_key = key;
        self
    }

    /// Copy of this record marked as retired
    pub fn retired(&self, now: DateTime<Utc>) -> Self {
        Self {
            tombstoned: true,
            last_synced_at: now,
            ..self.clone()
        }
    }
}

// ============================================================================
// Index
// ============================================================================

/// O(1) secondary index over the mapping records of one kind
#[derive(Debug, Clone)]
pub struct MappingIndex {
    kind: EntityKind,
    records: HashMap<MappingId, MappingRecord>,
    by_local: HashMap<String, MappingId>,
    by_remote: HashMap<String, MappingId>,
    retired_local: HashMap<String, MappingId>,
    retired_remote: HashMap<String, MappingId>,
    dedup: DedupIndex,
}

impl MappingIndex {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            records: HashMap::new(),
            by_local: HashMap::new(),
            by_remote: HashMap::new(),
            retired_local: HashMap::new(),
            retired_remote: HashMap::new(),
            dedup: DedupIndex::new(),
        }
    }

    /// Build the index from persisted records.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MappingConsistency` if two live records claim the
    /// same local or remote id, or a record belongs to another kind.
    pub fn build(kind: EntityKind, records: Vec<MappingRecord>) -> Result<Self> {
        let mut index = Self::new(kind);
        for record in records {
            index.check(&record)?;
            index.insert(record);
        }
        Ok(index)
    }

    /// Verify that `record` can be stored without breaking the one-to-one
    /// invariant.
    pub fn check(&self, record: &MappingRecord) -> Result<()> {
        if record.kind != self.kind {
            return Err(self.violation(format!(
                "mapping {} has kind {}",
                record.id, record.kind
            )));
        }

        if record.tombstoned {
            return Ok(());
        }

        if let Some(local_id) = &record.local_id {
            if let Some(owner) = self.by_local.get(local_id) {
                if *owner != record.id {
                    return Err(self.violation(format!(
                        "local id {} is claimed by mappings {} and {}",
                        local_id, owner, record.id
                    )));
                }
            }
        }

        if let Some(remote_id) = &record.remote_id {
            if let Some(owner) = self.by_remote.get(remote_id) {
                if *owner != record.id {
                    return Err(self.violation(format!(
                        "remote id {} is claimed by mappings {} and {}",
                        remote_id, owner, record.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Insert or replace a record. Callers run [`check`](Self::check) first.
    pub fn insert(&mut self, record: MappingRecord) {
        self.unlink(&record.id);

        let (local_map, remote_map) = if record.tombstoned {
            (&mut self.retired_local, &mut self.retired_remote)
        } else {
            (&mut self.by_local, &mut self.by_remote)
        };
        if let Some(local_id) = &record.local_id {
            local_map.insert(local_id.clone(), record.id);
        }
        if let Some(remote_id) = &record.remote_id {
            remote_map.insert(remote_id.clone(), record.id);
        }
        if let (false, Some(key)) = (record.tombstoned, &record.content_key) {
            self.dedup.insert(key.clone(), record.id);
        }

        self.records.insert(record.id, record);
    }

    fn unlink(&mut self, id: &MappingId) {
        let Some(previous) = self.records.remove(id) else {
            return;
        };

        for (map, key) in [
            (&mut self.by_local, &previous.local_id),
            (&mut self.by_remote, &previous.remote_id),
            (&mut self.retired_local, &previous.local_id),
            (&mut self.retired_remote, &previous.remote_id),
        ] {
            if let Some(key) = key {
                if map.get(key) == Some(id) {
                    map.remove(key);
                }
            }
        }
        if let Some(key) = &previous.content_key {
            self.dedup.remove(key, id);
        }
    }

    fn violation(&self, message: String) -> SyncError {
        SyncError::MappingConsistency {
            kind: self.kind,
            message,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn get(&self, id: &MappingId) -> Option<&MappingRecord> {
        self.records.get(id)
    }

    /// Live record holding `local_id`
    pub fn get_by_local(&self, local_id: &str) -> Option<&MappingRecord> {
        self.by_local.get(local_id).and_then(|id| self.records.get(id))
    }

    /// Live record holding `remote_id`
    pub fn get_by_remote(&self, remote_id: &str) -> Option<&MappingRecord> {
        self.by_remote.get(remote_id).and_then(|id| self.records.get(id))
    }

    pub fn get_by_side(&self, side: Side, id: &str) -> Option<&MappingRecord> {
        match side {
            Side::Local => self.get_by_local(id),
            Side::Remote => self.get_by_remote(id),
        }
    }

    /// Retired record that last held `id` on `side`
    pub fn retired_by_side(&self, side: Side, id: &str) -> Option<&MappingRecord> {
        let map = match side {
            Side::Local => &self.retired_local,
            Side::Remote => &self.retired_remote,
        };
        map.get(id).and_then(|mapping_id| self.records.get(mapping_id))
    }

    /// Live record tracking asset content `key`
    pub fn get_by_content_key(&self, key: &ContentKey) -> Option<&MappingRecord> {
        self.dedup.lookup(key).and_then(|id| self.records.get(id))
    }

    /// Live records in a stable order
    pub fn live_records(&self) -> Vec<&MappingRecord> {
        let mut live: Vec<&MappingRecord> =
            self.records.values().filter(|r| !r.tombstoned).collect();
        live.sort_by_key(|r| r.id);
        live
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
