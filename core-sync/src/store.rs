//! # Identity Mapping Store
//!
//! Durable persistence for mapping records and per-kind single-flight access.
//!
//! ## Overview
//!
//! - [`MappingStore`] - storage abstraction injected into the engine
//! - [`SqliteMappingStore`] - append-only journal in SQLite
//! - [`MappingPartitions`] - one lock per entity kind; a run must hold its
//!   kind's [`MappingPartition`] to read or write mappings
//!
//! ## Journal layout
//!
//! Every upsert appends a full row to `mapping_journal`; the row with the
//! highest sequence number per `mapping_id` is the live record. A reader
//! therefore sees either the old or the new version of a record, never a mix.
//! [`MappingStore::compact`] folds superseded rows away in one transaction.

use crate::dedup::ContentKey;
use crate::entity::Fingerprint;
use crate::error::{Result, SyncError};
use crate::mapping::{MappingId, MappingIndex, MappingRecord};
use async_trait::async_trait;
use bridge_traits::{EntityKind, SyncDirection};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

// ============================================================================
// Store Trait
// ============================================================================

/// Persistence contract for mapping records
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Latest version of every mapping of `kind`, retired ones included
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn get(&self, kind: EntityKind) -> Result<Vec<MappingRecord>>;

    /// Append a new version of `record`
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn upsert(&self, record: &MappingRecord) -> Result<()>;

    /// Append a retired version of `record`
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn tombstone(&self, record: &MappingRecord) -> Result<()> {
        let mut retired = record.clone();
        retired.tombstoned = true;
        self.upsert(&retired).await
    }

    /// Drop superseded versions for `kind`; returns the number of rows removed
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn compact(&self, kind: EntityKind) -> Result<u64>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of [`MappingStore`]
pub struct SqliteMappingStore {
    pool: SqlitePool,
}

impl SqliteMappingStore {
    /// Create a new SQLite mapping store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database table if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mapping_journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                mapping_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_id TEXT,
                remote_id TEXT,
                last_local_fingerprint TEXT,
                last_remote_fingerprint TEXT,
                last_local_modified_at INTEGER,
                last_remote_modified_at INTEGER,
                last_synced_at INTEGER NOT NULL,
                direction_hint TEXT,
                content_key TEXT,
                conflict_streak INTEGER NOT NULL DEFAULT 0,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_mapping_journal_kind_mapping
            ON mapping_journal(kind, mapping_id, seq DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

/// Database row representation of a journal entry
#[derive(Debug, FromRow)]
struct MappingRow {
    mapping_id: String,
    kind: String,
    local_id: Option<String>,
    remote_id: Option<String>,
    last_local_fingerprint: Option<String>,
    last_remote_fingerprint: Option<String>,
    last_local_modified_at: Option<i64>,
    last_remote_modified_at: Option<i64>,
    last_synced_at: i64,
    direction_hint: Option<String>,
    content_key: Option<String>,
    conflict_streak: i64,
    tombstoned: i64,
}

impl TryFrom<MappingRow> for MappingRecord {
    type Error = SyncError;

    fn try_from(row: MappingRow) -> Result<Self> {
        let kind = row
            .kind
            .parse::<EntityKind>()
            .map_err(SyncError::Database)?;
        let direction_hint = row
            .direction_hint
            .as_deref()
            .map(str::parse::<SyncDirection>)
            .transpose()
            .map_err(SyncError::Database)?;
        let content_key = row
            .content_key
            .as_deref()
            .map(|hex| {
                ContentKey::from_hex(hex)
                    .ok_or_else(|| SyncError::Database(format!("Invalid content key: {}", hex)))
            })
            .transpose()?;

        Ok(MappingRecord {
            id: MappingId::from_string(&row.mapping_id)?,
            kind,
            local_id: row.local_id,
            remote_id: row.remote_id,
            last_local_fingerprint: decode_fingerprint(row.last_local_fingerprint)?,
            last_remote_fingerprint: decode_fingerprint(row.last_remote_fingerprint)?,
            last_local_modified_at: row.last_local_modified_at.and_then(from_millis),
            last_remote_modified_at: row.last_remote_modified_at.and_then(from_millis),
            last_synced_at: from_millis(row.last_synced_at).ok_or_else(|| {
                SyncError::Database(format!("Invalid last_synced_at: {}", row.last_synced_at))
            })?,
            direction_hint,
            content_key,
            conflict_streak: u32::try_from(row.conflict_streak).unwrap_or(0),
            tombstoned: row.tombstoned != 0,
        })
    }
}

fn encode_fingerprint(fingerprint: &Option<Fingerprint>) -> Result<Option<String>> {
    fingerprint
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| SyncError::Database(format!("Failed to encode fingerprint: {}", e)))
}

fn decode_fingerprint(raw: Option<String>) -> Result<Option<Fingerprint>> {
    raw.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| SyncError::Database(format!("Failed to decode fingerprint: {}", e)))
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn get(&self, kind: EntityKind) -> Result<Vec<MappingRecord>> {
        let rows = sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT j.mapping_id, j.kind, j.local_id, j.remote_id,
                   j.last_local_fingerprint, j.last_remote_fingerprint,
                   j.last_local_modified_at, j.last_remote_modified_at,
                   j.last_synced_at, j.direction_hint, j.content_key,
                   j.conflict_streak, j.tombstoned
            FROM mapping_journal j
            JOIN (
                SELECT mapping_id, MAX(seq) AS seq
                FROM mapping_journal
                WHERE kind = ?
                GROUP BY mapping_id
            ) latest ON j.seq = latest.seq
            ORDER BY j.mapping_id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter().map(MappingRecord::try_from).collect()
    }

    async fn upsert(&self, record: &MappingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mapping_journal (
                mapping_id, kind, local_id, remote_id,
                last_local_fingerprint, last_remote_fingerprint,
                last_local_modified_at, last_remote_modified_at,
                last_synced_at, direction_hint, content_key,
                conflict_streak, tombstoned, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.local_id)
        .bind(&record.remote_id)
        .bind(encode_fingerprint(&record.last_local_fingerprint)?)
        .bind(encode_fingerprint(&record.last_remote_fingerprint)?)
        .bind(record.last_local_modified_at.map(|t| t.timestamp_millis()))
        .bind(record.last_remote_modified_at.map(|t| t.timestamp_millis()))
        .bind(record.last_synced_at.timestamp_millis())
        .bind(record.direction_hint.map(|d| d.as_str()))
        .bind(record.content_key.as_ref().map(|k| k.as_str().to_string()))
        .bind(record.conflict_streak as i64)
        .bind(record.tombstoned as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self), fields(kind = %kind))]
    async fn compact(&self, kind: EntityKind) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            DELETE FROM mapping_journal
            WHERE kind = ?
              AND seq NOT IN (
                  SELECT MAX(seq) FROM mapping_journal WHERE kind = ? GROUP BY mapping_id
              )
            "#,
        )
        .bind(kind.as_str())
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        debug!(removed = result.rows_affected(), "Mapping journal compacted");
        Ok(result.rows_affected())
    }
}

// ============================================================================
// Partitions (single-flight per kind)
// ============================================================================

/// Per-kind exclusive access to the mapping store
///
/// Runs for different kinds proceed in parallel; runs for the same kind are
/// serialized by the kind's lock.
pub struct MappingPartitions {
    store: Arc<dyn MappingStore>,
    locks: std::sync::Mutex<HashMap<EntityKind, Arc<Mutex<()>>>>,
}

impl MappingPartitions {
    pub fn new(store: Arc<dyn MappingStore>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn MappingStore> {
        Arc::clone(&self.store)
    }

    /// Wait for the kind's lock, then load its mappings
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MappingConsistency` if the persisted records break
    /// the one-to-one invariant, or a database error.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn acquire(&self, kind: EntityKind) -> Result<MappingPartition> {
        let guard = self.lock_for(kind).lock_owned().await;
        self.load(kind, guard).await
    }

    /// Take the kind's lock without waiting
    ///
    /// # Errors
    ///
    /// Returns `SyncError::SyncInProgress` if another run holds the kind.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn try_acquire(&self, kind: EntityKind) -> Result<MappingPartition> {
        let guard = self
            .lock_for(kind)
            .try_lock_owned()
            .map_err(|_| SyncError::SyncInProgress { kind })?;
        self.load(kind, guard).await
    }

    fn lock_for(&self, kind: EntityKind) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(kind).or_default())
    }

    async fn load(&self, kind: EntityKind, guard: OwnedMutexGuard<()>) -> Result<MappingPartition> {
        let records = self.store.get(kind).await?;
        let count = records.len();
        let index = MappingIndex::build(kind, records)?;
        info!(kind = %kind, mappings = count, "Mapping partition loaded");

        Ok(MappingPartition {
            kind,
            store: Arc::clone(&self.store),
            index,
            _guard: guard,
        })
    }
}

/// Exclusive handle on one kind's mappings for the duration of a run
pub struct MappingPartition {
    kind: EntityKind,
    store: Arc<dyn MappingStore>,
    index: MappingIndex,
    _guard: OwnedMutexGuard<()>,
}

impl MappingPartition {
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn index(&self) -> &MappingIndex {
        &self.index
    }

    /// Persist a new version of `record` and update the index.
    ///
    /// The one-to-one invariant is checked before anything is written.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MappingConsistency` if `record` would give an id
    /// two counterparts, or a database error.
    pub async fn upsert(&mut self, record: MappingRecord) -> Result<()> {
        self.index.check(&record)?;
        self.store.upsert(&record).await?;
        self.index.insert(record);
        Ok(())
    }

    /// Persist `record` as retired.
    pub async fn tombstone(&mut self, record: MappingRecord) -> Result<()> {
        let mut retired = record;
        retired.tombstoned = true;
        self.index.check(&retired)?;
        self.store.tombstone(&retired).await?;
        self.index.insert(retired);
        Ok(())
    }

    pub async fn compact(&self) -> Result<u64> {
        self.store.compact(self.kind).await
    }
}
