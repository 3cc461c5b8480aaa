//! # Core Configuration Module
//!
//! Provides configuration management for the record sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance holding the engine tuning knobs ([`ReconcileConfig`]) and the
//! per-kind policies ([`KindPolicy`]). Validation is fail-fast: a config that
//! would make the engine misbehave (zero concurrency, zero timeouts, a backoff
//! cap below the initial delay) is rejected at build time with an actionable
//! message.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{CoreConfig, KindPolicy};
//! use bridge_traits::{EntityKind, SyncDirection};
//!
//! let config = CoreConfig::builder()
//!     .database_path("/path/to/recordsync.db")
//!     .max_concurrent_applies(8)
//!     .kind_policy(EntityKind::Reminder, KindPolicy::new(SyncDirection::RemoteAuthoritative))
//!     .build()?;
//! ```
//!
//! The same shape can be loaded from a JSON document; durations are written
//! in milliseconds:
//!
//! ```ignore
//! let config = CoreConfig::from_json(r#"{
//!     "database_path": "/var/lib/recordsync/state.db",
//!     "reconcile": { "skew_tolerance_ms": 2000 },
//!     "kind_policies": { "photo": { "direction": "local_authoritative" } }
//! }"#)?;
//! ```

use crate::error::{Error, Result};

use bridge_traits::{EntityKind, SyncDirection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Policies
// ============================================================================

/// Which side wins a conflict when neither timestamps nor baseline
/// divergence decide it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPreference {
    #[default]
    PreferLocal,
    PreferRemote,
}

impl ConflictPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPreference::PreferLocal => "prefer_local",
            ConflictPreference::PreferRemote => "prefer_remote",
        }
    }
}

/// Sync policy for one entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KindPolicy {
    pub direction: SyncDirection,
    pub conflict_preference: ConflictPreference,
}

impl KindPolicy {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            conflict_preference: ConflictPreference::default(),
        }
    }

    pub fn with_conflict_preference(mut self, preference: ConflictPreference) -> Self {
        self.conflict_preference = preference;
        self
    }

    /// Built-in policy for a kind
    ///
    /// Photos are export-only: the local library is authoritative. Every
    /// other kind syncs both ways and prefers the local copy on ties.
    pub fn default_for(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Photo => Self::new(SyncDirection::LocalAuthoritative),
            _ => Self::default(),
        }
    }
}

// ============================================================================
// Engine tuning
// ============================================================================

/// Tuning knobs for the reconciliation driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Timestamps closer than this are treated as concurrent
    #[serde(rename = "skew_tolerance_ms", with = "duration_millis")]
    pub skew_tolerance: Duration,
    /// Upper bound on apply commands in flight per run
    pub max_concurrent_applies: usize,
    /// Timeout applied to every adapter call
    #[serde(rename = "call_timeout_ms", with = "duration_millis")]
    pub call_timeout: Duration,
    /// Total attempts for a retryable apply failure (1 = no retry)
    pub retry_attempts: u32,
    #[serde(rename = "initial_backoff_ms", with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "duration_millis")]
    pub max_backoff: Duration,
    /// Consecutive conflicts on one pair before it is held for review
    pub oscillation_threshold: u32,
    /// Fold the mapping journal after every non-dry run
    pub compact_after_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            skew_tolerance: Duration::from_secs(5),
            max_concurrent_applies: 4,
            call_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            oscillation_threshold: 3,
            compact_after_run: true,
        }
    }
}

impl ReconcileConfig {
    /// Validates the tuning values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_applies == 0 {
            return Err(Error::Config(
                "max_concurrent_applies must be at least 1".to_string(),
            ));
        }

        if self.call_timeout.is_zero() {
            return Err(Error::Config(
                "call_timeout must be greater than zero".to_string(),
            ));
        }

        if self.retry_attempts == 0 {
            return Err(Error::Config(
                "retry_attempts must be at least 1 (1 disables retries)".to_string(),
            ));
        }

        if self.max_backoff < self.initial_backoff {
            return Err(Error::Config(format!(
                "max_backoff ({} ms) must not be below initial_backoff ({} ms)",
                self.max_backoff.as_millis(),
                self.initial_backoff.as_millis()
            )));
        }

        if self.oscillation_threshold == 0 {
            return Err(Error::Config(
                "oscillation_threshold must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based), doubling from
    /// `initial_backoff` and capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map(|d| d.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }
}

// ============================================================================
// Core configuration
// ============================================================================

/// Core configuration for the record sync engine
///
/// Use [`CoreConfigBuilder`] or [`CoreConfig::from_json`] to construct
/// instances; both validate before returning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Path to the SQLite database holding mappings and run history
    pub database_path: PathBuf,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Per-kind overrides; kinds not listed use [`KindPolicy::default_for`]
    #[serde(default)]
    pub kind_policies: HashMap<EntityKind, KindPolicy>,
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Parse` for malformed JSON and `Error::Config` when the
    /// document parses but fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Policy in effect for `kind`
    pub fn policy_for(&self, kind: EntityKind) -> KindPolicy {
        self.kind_policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| KindPolicy::default_for(kind))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the database path is empty or any tuning
    /// value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "Database path cannot be empty. Use \":memory:\" for an in-memory store."
                    .to_string(),
            ));
        }

        self.reconcile.validate()
    }
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    reconcile: ReconcileConfig,
    kind_policies: HashMap<EntityKind, KindPolicy>,
}

impl CoreConfigBuilder {
    /// Sets the database file path (required).
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file, or `":memory:"`
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Replaces the whole tuning block.
    pub fn reconcile(mut self, reconcile: ReconcileConfig) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Sets the clock skew tolerance.
    ///
    /// Default: 5 seconds
    pub fn skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.reconcile.skew_tolerance = tolerance;
        self
    }

    /// Sets the apply concurrency limit.
    ///
    /// Default: 4
    pub fn max_concurrent_applies(mut self, limit: usize) -> Self {
        self.reconcile.max_concurrent_applies = limit;
        self
    }

    /// Sets the per-call adapter timeout.
    ///
    /// Default: 30 seconds
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile.call_timeout = timeout;
        self
    }

    /// Sets the retry schedule for retryable apply failures.
    ///
    /// # Arguments
    ///
    /// * `attempts` - Total attempts including the first one
    /// * `initial` - Delay before the first retry
    /// * `max` - Cap on the doubled delay
    pub fn retry_policy(mut self, attempts: u32, initial: Duration, max: Duration) -> Self {
        self.reconcile.retry_attempts = attempts;
        self.reconcile.initial_backoff = initial;
        self.reconcile.max_backoff = max;
        self
    }

    /// Sets the conflict streak that holds a pair for review.
    ///
    /// Default: 3
    pub fn oscillation_threshold(mut self, threshold: u32) -> Self {
        self.reconcile.oscillation_threshold = threshold;
        self
    }

    /// Enables or disables journal compaction after each run.
    ///
    /// Default: true
    pub fn compact_after_run(mut self, enabled: bool) -> Self {
        self.reconcile.compact_after_run = enabled;
        self
    }

    /// Overrides the policy for one kind.
    pub fn kind_policy(mut self, kind: EntityKind, policy: KindPolicy) -> Self {
        self.kind_policies.insert(kind, policy);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the database path is missing or validation fails.
    pub fn build(self) -> Result<CoreConfig> {
        let database_path = self.database_path.ok_or_else(|| {
            Error::Config(
                "Database path is required. Call .database_path() on the builder.".to_string(),
            )
        })?;

        let config = CoreConfig {
            database_path,
            reconcile: self.reconcile,
            kind_policies: self.kind_policies,
        };

        config.validate()?;
        Ok(config)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
