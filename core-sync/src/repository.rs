//! # Run History Repository
//!
//! Provides database persistence for run reports.
//!
//! ## Overview
//!
//! Every completed non-dry run is stored with its full report so the API
//! layer and scheduler can show what happened without re-running anything:
//! - Recording a finished run
//! - Fetching the latest run for a kind
//! - Run history per kind (most recent first)

use crate::error::{Result, SyncError};
use crate::report::RunReport;
use async_trait::async_trait;
use bridge_traits::EntityKind;
use sqlx::{FromRow, SqlitePool};

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for run report persistence
#[async_trait]
pub trait RunReportRepository: Send + Sync {
    /// Store a finished run
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be encoded or the database
    /// operation fails
    async fn insert(&self, report: &RunReport) -> Result<()>;

    /// Get the most recent run for a kind
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn latest(&self, kind: EntityKind) -> Result<Option<RunReport>>;

    /// Get run history for a kind (most recent first)
    ///
    /// # Arguments
    ///
    /// * `kind` - The entity kind to get history for
    /// * `limit` - Maximum number of runs to return
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn history(&self, kind: EntityKind, limit: u32) -> Result<Vec<RunReport>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of RunReportRepository
pub struct SqliteRunReportRepository {
    pool: SqlitePool,
}

impl SqliteRunReportRepository {
    /// Create a new SQLite run report repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize database table if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_history (
                run_id TEXT PRIMARY KEY NOT NULL,
                kind TEXT NOT NULL,
                dry_run INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                applied INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                report TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_run_history_kind_started
            ON run_history(kind, started_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }
}

/// Database row representation of a run
#[derive(Debug, FromRow)]
struct RunRow {
    report: String,
}

impl TryFrom<RunRow> for RunReport {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self> {
        serde_json::from_str(&row.report)
            .map_err(|e| SyncError::Database(format!("Invalid stored run report: {}", e)))
    }
}

#[async_trait]
impl RunReportRepository for SqliteRunReportRepository {
    async fn insert(&self, report: &RunReport) -> Result<()> {
        let encoded = serde_json::to_string(report)
            .map_err(|e| SyncError::Database(format!("Failed to encode run report: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO run_history (
                run_id, kind, dry_run, cancelled, started_at, finished_at,
                applied, error_count, report
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.run_id)
        .bind(report.kind.as_str())
        .bind(report.dry_run as i64)
        .bind(report.cancelled as i64)
        .bind(report.started_at.timestamp_millis())
        .bind(report.finished_at.map(|t| t.timestamp_millis()))
        .bind(report.applied as i64)
        .bind(report.errors.len() as i64)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn latest(&self, kind: EntityKind) -> Result<Option<RunReport>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT report
            FROM run_history
            WHERE kind = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.map(RunReport::try_from).transpose()
    }

    async fn history(&self, kind: EntityKind, limit: u32) -> Result<Vec<RunReport>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT report
            FROM run_history
            WHERE kind = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(kind.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.into_iter()
            .map(RunReport::try_from)
            .collect::<Result<Vec<_>>>()
    }
}
