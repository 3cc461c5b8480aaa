//! # Sync Coordinator
//!
//! Runs reconciliation for every registered entity kind.
//!
//! ## Overview
//!
//! The `SyncCoordinator` is the entry point hosts call. It:
//! - Holds one [`SyncTarget`] (local + remote adapter) per entity kind
//! - Enforces single-flight per kind through [`MappingPartitions`]
//! - Runs one kind, or every registered kind concurrently
//! - Tracks active runs so they can be cancelled
//! - Persists reports of non-dry runs to the run history
//! - Emits lifecycle events via `EventBus`
//!
//! ## Workflow
//!
//! 1. Take the kind's partition (fails fast with `SyncInProgress`)
//! 2. Emit `RunStarted` and register the run's cancellation token
//! 3. Fetch snapshots and reconcile through the [`ReconciliationDriver`]
//! 4. Emit `EntityFailed` / `ReviewRequired` for every itemized error
//! 5. Persist the report (non-dry runs only)
//! 6. Emit exactly one of `RunCompleted`, `RunCancelled` or `RunFailed`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{SyncCoordinator, SyncTarget};
//! use bridge_traits::EntityKind;
//! use std::sync::Arc;
//!
//! # async fn example(config: core_runtime::config::CoreConfig) -> core_sync::Result<()> {
//! let coordinator = SyncCoordinator::open(config, Arc::new(EventBus::default())).await?;
//! coordinator
//!     .register_target(EntityKind::Reminder, SyncTarget::new(reminders_app, caldav))
//!     .await;
//!
//! let report = coordinator.run_kind(EntityKind::Reminder, false).await?;
//! println!("{} applied, {} errors", report.applied, report.errors.len());
//! # Ok(())
//! # }
//! ```

use crate::db::{create_pool, DatabaseConfig};
use crate::driver::{ReconciliationDriver, RunOptions, SyncTarget};
use crate::entity::Side;
use crate::error::{Result, SyncError};
use crate::report::{EntityErrorKind, RunReport};
use crate::repository::{RunReportRepository, SqliteRunReportRepository};
use crate::store::{MappingPartitions, MappingStore, SqliteMappingStore};
use bridge_traits::{Clock, EntityKind, SystemClock};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Active run tracking
#[derive(Clone)]
struct ActiveRun {
    run_id: String,
    cancellation_token: CancellationToken,
}

/// Coordinator for reconciliation runs across entity kinds
pub struct SyncCoordinator {
    /// Configuration
    config: CoreConfig,

    /// Reconciliation driver shared by all kinds
    driver: Arc<ReconciliationDriver>,

    /// Per-kind mapping partitions
    partitions: Arc<MappingPartitions>,

    /// Run history
    reports: Arc<dyn RunReportRepository>,

    /// Event bus for emitting run events
    event_bus: Arc<EventBus>,

    /// Adapter pairs by kind
    targets: Arc<RwLock<HashMap<EntityKind, SyncTarget>>>,

    /// Active runs by kind
    active_runs: Arc<Mutex<HashMap<EntityKind, ActiveRun>>>,
}

impl SyncCoordinator {
    /// Create a coordinator over injected storage
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` if the configuration is invalid.
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn MappingStore>,
        reports: Arc<dyn RunReportRepository>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let driver = Arc::new(ReconciliationDriver::new(config.reconcile.clone(), clock));

        Ok(Self {
            config,
            driver,
            partitions: Arc::new(MappingPartitions::new(store)),
            reports,
            event_bus,
            targets: Arc::new(RwLock::new(HashMap::new())),
            active_runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Open the SQLite database named by the configuration and create a
    /// coordinator over it
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Database` if the database cannot be opened, or
    /// `SyncError::Config` if the configuration is invalid.
    pub async fn open(config: CoreConfig, event_bus: Arc<EventBus>) -> Result<Self> {
        let pool = create_pool(DatabaseConfig::from_path(&config.database_path)).await?;
        let store = Arc::new(SqliteMappingStore::new(pool.clone()));
        let reports = Arc::new(SqliteRunReportRepository::new(pool));
        Self::new(config, store, reports, event_bus, Arc::new(SystemClock))
    }

    /// Register the adapter pair for a kind, replacing any previous one
    pub async fn register_target(&self, kind: EntityKind, target: SyncTarget) {
        let mut targets = self.targets.write().await;
        info!(kind = %kind, target = ?target, "Registered sync target");
        targets.insert(kind, target);
    }

    /// Kinds with a registered adapter pair, in stable order
    pub async fn registered_kinds(&self) -> Vec<EntityKind> {
        let targets = self.targets.read().await;
        let mut kinds: Vec<EntityKind> = targets.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Run one reconciliation pass for `kind`
    ///
    /// # Errors
    ///
    /// - `SyncError::AdapterNotRegistered` if no target is registered
    /// - `SyncError::SyncInProgress` if a run for `kind` is already active
    /// - `SyncError::MappingConsistency` or `SyncError::Snapshot` if the run
    ///   aborted
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn run_kind(&self, kind: EntityKind, dry_run: bool) -> Result<RunReport> {
        let target = {
            let targets = self.targets.read().await;
            targets
                .get(&kind)
                .cloned()
                .ok_or(SyncError::AdapterNotRegistered { kind })?
        };

        let options = RunOptions::new(dry_run);
        let run_id = options.run_id.clone();

        let mut partition = match self.partitions.try_acquire(kind).await {
            Ok(partition) => partition,
            Err(e @ SyncError::SyncInProgress { .. }) => return Err(e),
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to load mapping partition");
                self.emit_failed(&run_id, kind, &e);
                return Err(e);
            }
        };

        {
            let mut active_runs = self.active_runs.lock().await;
            active_runs.insert(
                kind,
                ActiveRun {
                    run_id: run_id.clone(),
                    cancellation_token: options.cancel.clone(),
                },
            );
        }

        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::RunStarted {
                run_id: run_id.clone(),
                kind,
                dry_run,
            }))
            .ok();

        let policy = self.config.policy_for(kind);
        let result = self
            .driver
            .run(&mut partition, &target, &policy, &options)
            .await;

        {
            let mut active_runs = self.active_runs.lock().await;
            active_runs.remove(&kind);
        }
        drop(partition);

        match result {
            Ok(report) => {
                self.emit_entity_events(&report);

                if !report.dry_run {
                    if let Err(e) = self.reports.insert(&report).await {
                        warn!(run_id = %report.run_id, error = %e, "Failed to record run history");
                    }
                }

                let event = if report.cancelled {
                    SyncEvent::RunCancelled {
                        run_id: report.run_id.clone(),
                        kind,
                        applied: report.applied,
                        skipped: report.skipped(),
                    }
                } else {
                    SyncEvent::RunCompleted {
                        run_id: report.run_id.clone(),
                        kind,
                        applied: if report.dry_run {
                            report.actions.len() as u64
                        } else {
                            report.applied
                        },
                        failed: report.failed(),
                        unchanged: report.counts.unchanged,
                        duration_ms: report.duration_ms(),
                    }
                };
                self.event_bus.emit(CoreEvent::Sync(event)).ok();

                info!(
                    kind = %kind,
                    run_id = %report.run_id,
                    applied = report.applied,
                    errors = report.errors.len(),
                    cancelled = report.cancelled,
                    "Run finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(kind = %kind, run_id = %run_id, error = %e, "Run failed");
                self.emit_failed(&run_id, kind, &e);
                Err(e)
            }
        }
    }

    /// Run every registered kind concurrently
    ///
    /// Each kind's result is returned separately; one kind failing does not
    /// affect the others.
    #[instrument(skip(self))]
    pub async fn run_all(&self, dry_run: bool) -> Vec<(EntityKind, Result<RunReport>)> {
        let kinds = self.registered_kinds().await;
        join_all(
            kinds
                .into_iter()
                .map(|kind| async move { (kind, self.run_kind(kind, dry_run).await) }),
        )
        .await
    }

    /// Cancel the active run for `kind`
    ///
    /// Actions that have not started are skipped; in-flight ones finish and
    /// commit their mappings.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::RunNotFound` if no run is active for `kind`.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn cancel(&self, kind: EntityKind) -> Result<()> {
        let active_run = {
            let active_runs = self.active_runs.lock().await;
            active_runs.get(&kind).cloned()
        };

        match active_run {
            Some(run) => {
                run.cancellation_token.cancel();
                info!(run_id = %run.run_id, "Cancellation requested");
                Ok(())
            }
            None => Err(SyncError::RunNotFound { kind }),
        }
    }

    /// Check if a run is currently active for `kind`
    pub async fn is_running(&self, kind: EntityKind) -> bool {
        let active_runs = self.active_runs.lock().await;
        active_runs.contains_key(&kind)
    }

    /// Run history for `kind`, most recent first
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn history(&self, kind: EntityKind, limit: u32) -> Result<Vec<RunReport>> {
        self.reports.history(kind, limit).await
    }

    /// Most recent recorded run for `kind`
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    pub async fn latest_report(&self, kind: EntityKind) -> Result<Option<RunReport>> {
        self.reports.latest(kind).await
    }

    /// Mapping store shared by all kinds
    pub fn mapping_store(&self) -> Arc<dyn MappingStore> {
        self.partitions.store()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn emit_entity_events(&self, report: &RunReport) {
        for item in &report.errors {
            let event = match item.kind {
                EntityErrorKind::ReviewRequired => {
                    let id = Some(item.entity_id.clone());
                    let (local_id, remote_id) = match item.side {
                        Some(Side::Remote) => (None, id),
                        _ => (id, None),
                    };
                    SyncEvent::ReviewRequired {
                        run_id: report.run_id.clone(),
                        kind: report.kind,
                        local_id,
                        remote_id,
                        reason: item.message.clone(),
                    }
                }
                // Skips are summarized by the terminal event
                EntityErrorKind::Cancelled => continue,
                _ => SyncEvent::EntityFailed {
                    run_id: report.run_id.clone(),
                    kind: report.kind,
                    entity_id: item.entity_id.clone(),
                    message: item.message.clone(),
                    retryable: item.is_retryable(),
                },
            };
            self.event_bus.emit(CoreEvent::Sync(event)).ok();
        }
    }

    fn emit_failed(&self, run_id: &str, kind: EntityKind, error: &SyncError) {
        self.event_bus
            .emit(CoreEvent::Sync(SyncEvent::RunFailed {
                run_id: run_id.to_string(),
                kind,
                message: error.to_string(),
            }))
            .ok();
    }
}
