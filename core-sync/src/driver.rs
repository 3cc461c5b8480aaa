//! # Reconciliation Driver
//!
//! Runs one reconciliation pass for one entity kind.
//!
//! ## Workflow
//!
//! 1. Fetch both snapshots (each call bounded by `call_timeout`)
//! 2. Hash photo files listed by path, then normalize; bad records become
//!    per-entity errors
//! 3. Classify every pair against the kind's mappings. A mapped entity whose
//!    record could not be read is left alone rather than read as deleted
//! 4. Resolve conflicts and plan one action per pair
//! 5. Dry run: report the plan and stop
//! 6. Dispatch actions concurrently, at most `max_concurrent_applies` at a
//!    time; each action applies through the adapter with bounded retry and
//!    commits its mapping only after the adapter confirmed the write
//! 7. Clear the conflict streak of pairs found unchanged
//! 8. Compact the mapping journal
//!
//! ## Failure isolation
//!
//! A failed apply is recorded against its entity and the rest of the batch
//! continues. Creates append a pending mapping before calling the adapter, so
//! an entity whose create failed is left pending and is re-issued on the next
//! run. Only a mapping consistency violation stops the run: actions not yet
//! started are skipped, in-flight ones finish, and the error is returned.
//!
//! ## Cancellation
//!
//! Cancelling the run's token stops new actions from starting. Actions that
//! already called their adapter finish and commit.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let driver = ReconciliationDriver::new(config.reconcile.clone(), Arc::new(SystemClock));
//! let mut partition = partitions.acquire(EntityKind::Note).await?;
//! let report = driver
//!     .run(&mut partition, &target, &config.policy_for(EntityKind::Note), &RunOptions::new(false))
//!     .await?;
//! ```

use crate::apply::{call_with_retry, call_with_timeout, ApplyFailure, RetryPolicy};
use crate::classifier::{ChangeClassifier, ChangeState, ClassifiedPair};
use crate::entity::{NormalizedEntity, Side};
use crate::error::{Result, SyncError};
use crate::mapping::MappingRecord;
use crate::normalizer::{identify_asset_paths, normalize_snapshot};
use crate::report::{
    ActionKind, ActionStatus, EntityError, EntityErrorKind, PlannedAction, RunReport,
};
use crate::resolver::{ConflictResolver, Resolution};
use crate::store::MappingPartition;
use bridge_traits::{
    ApplyRequest, BridgeError, Clock, EntityAdapter, EntityKind, RawRecord, SyncDirection,
};
use core_runtime::config::{KindPolicy, ReconcileConfig};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Adapter pair for one kind
#[derive(Clone)]
pub struct SyncTarget {
    pub local: Arc<dyn EntityAdapter>,
    pub remote: Arc<dyn EntityAdapter>,
}

impl SyncTarget {
    pub fn new(local: Arc<dyn EntityAdapter>, remote: Arc<dyn EntityAdapter>) -> Self {
        Self { local, remote }
    }

    pub fn adapter(&self, side: Side) -> &dyn EntityAdapter {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }
}

impl std::fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTarget")
            .field("local", &self.local.name())
            .field("remote", &self.remote.name())
            .finish()
    }
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: String,
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: RunReport::new_run_id(),
            dry_run,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Raw snapshots of both sides
#[derive(Debug, Clone, Default)]
pub struct Snapshots {
    pub local: Vec<RawRecord>,
    pub remote: Vec<RawRecord>,
}

impl Snapshots {
    pub fn new(local: Vec<RawRecord>, remote: Vec<RawRecord>) -> Self {
        Self { local, remote }
    }
}

/// One planned action plus the pair it acts on
struct Job {
    seq: usize,
    action: PlannedAction,
    pair: ClassifiedPair,
}

struct JobOutcome {
    seq: usize,
    action: PlannedAction,
    error: Option<EntityError>,
    fatal: Option<SyncError>,
}

/// Shared state of one apply phase
struct ApplyContext<'a> {
    kind: EntityKind,
    target: &'a SyncTarget,
    partition: Mutex<&'a mut MappingPartition>,
    abort: CancellationToken,
}

/// Reconciliation driver
pub struct ReconciliationDriver {
    config: ReconcileConfig,
    classifier: ChangeClassifier,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ReconciliationDriver {
    pub fn new(config: ReconcileConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            classifier: ChangeClassifier::new(config.oscillation_threshold),
            resolver: ConflictResolver::new(config.skew_tolerance),
            retry: RetryPolicy::from_config(&config),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Fetch both snapshots, then reconcile them
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Snapshot` if either adapter fails to list its
    /// records, or any error [`reconcile`](Self::reconcile) returns.
    #[instrument(skip_all, fields(kind = %partition.kind(), run_id = %options.run_id))]
    pub async fn run(
        &self,
        partition: &mut MappingPartition,
        target: &SyncTarget,
        policy: &KindPolicy,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let snapshots = self.fetch_snapshots(partition.kind(), target).await?;
        self.reconcile(partition, target, policy, snapshots, options)
            .await
    }

    /// Fetch both sides concurrently, each bounded by `call_timeout`
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Snapshot` naming the side that failed.
    pub async fn fetch_snapshots(&self, kind: EntityKind, target: &SyncTarget) -> Result<Snapshots> {
        let limit = self.config.call_timeout;
        let (local, remote) = tokio::join!(
            call_with_timeout(limit, target.local.fetch_snapshot(kind)),
            call_with_timeout(limit, target.remote.fetch_snapshot(kind)),
        );

        let snapshot_error = |side: Side, adapter: &dyn EntityAdapter, error: BridgeError| {
            warn!(side = %side, adapter = adapter.name(), error = %error, "Snapshot fetch failed");
            SyncError::Snapshot {
                side: format!("{} ({})", side, adapter.name()),
                message: error.to_string(),
            }
        };
        let local = local.map_err(|e| snapshot_error(Side::Local, target.local.as_ref(), e))?;
        let remote = remote.map_err(|e| snapshot_error(Side::Remote, target.remote.as_ref(), e))?;

        debug!(local = local.len(), remote = remote.len(), "Snapshots fetched");
        Ok(Snapshots::new(local, remote))
    }

    /// Reconcile two snapshots against the partition's mappings
    ///
    /// Always produces a report unless the mappings turn out to be
    /// inconsistent; per-entity failures are itemized in the report.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::MappingConsistency` if an upsert would give an id
    /// two counterparts.
    #[instrument(skip_all, fields(kind = %partition.kind(), run_id = %options.run_id, dry_run = options.dry_run))]
    pub async fn reconcile(
        &self,
        partition: &mut MappingPartition,
        target: &SyncTarget,
        policy: &KindPolicy,
        snapshots: Snapshots,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let kind = partition.kind();
        let mut report = RunReport::new(&options.run_id, kind, options.dry_run, self.clock.now());

        let (local_raw, local_unreadable) = identify_asset_paths(snapshots.local, Side::Local).await;
        let (remote_raw, remote_unreadable) = identify_asset_paths(snapshots.remote, Side::Remote).await;
        let (local, local_errors) = normalize_snapshot(&local_raw, kind, Side::Local);
        let (remote, remote_errors) = normalize_snapshot(&remote_raw, kind, Side::Remote);
        report.errors.extend(local_unreadable);
        report.errors.extend(remote_unreadable);
        report.errors.extend(local_errors);
        report.errors.extend(remote_errors);

        let mut classification =
            self.classifier
                .classify(kind, &local, &remote, partition.index(), policy.direction);
        let unreadable = UnreadableIds::from_errors(&report.errors);
        classification.pairs.retain(|pair| !unreadable.hides(pair));
        report.counts = classification.counts();

        for review in &classification.reviews {
            let (side, entity_id) = match (&review.local_id, &review.remote_id) {
                (Some(id), _) => (Side::Local, id.clone()),
                (None, remote_id) => (Side::Remote, remote_id.clone().unwrap_or_default()),
            };
            report.errors.push(
                EntityError::new(EntityErrorKind::ReviewRequired, entity_id, &review.reason)
                    .with_side(side)
                    .with_mapping_id(review.mapping_id.map(|id| id.to_string())),
            );
        }

        let settled = classification.settled;
        let jobs = self.plan(classification.pairs, policy);
        info!(
            kind = %kind,
            local = local.len(),
            remote = remote.len(),
            actions = jobs.len(),
            reviews = report.counts.review_required,
            "Reconciliation planned"
        );

        if options.dry_run {
            report.actions = jobs.into_iter().map(|job| job.action).collect();
            report.finish(self.clock.now());
            return Ok(report);
        }

        let ctx = ApplyContext {
            kind,
            target,
            partition: Mutex::new(partition),
            abort: options.cancel.child_token(),
        };

        let mut outcomes: Vec<JobOutcome> = stream::iter(jobs.into_iter().map(|job| self.execute(job, &ctx)))
            .buffer_unordered(self.config.max_concurrent_applies.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|outcome| outcome.seq);

        let mut fatal = None;
        for outcome in outcomes {
            if outcome.action.status == ActionStatus::Applied {
                report.applied += 1;
            }
            report.actions.push(outcome.action);
            report.errors.extend(outcome.error);
            if fatal.is_none() {
                fatal = outcome.fatal;
            }
        }

        if let Some(error) = fatal {
            warn!(kind = %kind, error = %error, "Reconciliation aborted");
            return Err(error);
        }

        report.cancelled = options.cancel.is_cancelled();
        let partition = ctx.partition.into_inner();

        if !report.cancelled {
            for mut record in settled {
                record.conflict_streak = 0;
                if let Err(e) = partition.upsert(record).await {
                    warn!(error = %e, "Failed to clear conflict streak");
                }
            }
        }

        if self.config.compact_after_run && !report.cancelled {
            match partition.compact().await {
                Ok(removed) => debug!(removed, "Mapping journal compacted"),
                Err(e) => warn!(error = %e, "Mapping journal compaction failed"),
            }
        }

        report.finish(self.clock.now());
        info!(
            kind = %kind,
            applied = report.applied,
            failed = report.failed(),
            skipped = report.skipped(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Planning
    // ========================================================================

    fn plan(&self, pairs: Vec<ClassifiedPair>, policy: &KindPolicy) -> Vec<Job> {
        pairs
            .into_iter()
            .filter_map(|pair| {
                let (action, resolution) = self.action_for(&pair, policy)?;
                Some((action, resolution, pair))
            })
            .enumerate()
            .map(|(seq, (action, resolution, pair))| Job {
                seq,
                action: PlannedAction {
                    action,
                    state: pair.state,
                    mapping_id: pair.mapping.as_ref().map(|m| m.id.to_string()),
                    local_id: pair.local_id(),
                    remote_id: pair.remote_id(),
                    resolution,
                    status: ActionStatus::Planned,
                },
                pair,
            })
            .collect()
    }

    fn action_for(
        &self,
        pair: &ClassifiedPair,
        policy: &KindPolicy,
    ) -> Option<(ActionKind, Option<Resolution>)> {
        let action = match pair.state {
            ChangeState::Unchanged => {
                return pair.needs_relink.then_some((ActionKind::Relink, None));
            }
            ChangeState::LocalModified => ActionKind::PushUpdate,
            ChangeState::RemoteModified => ActionKind::PullUpdate,
            ChangeState::Conflict => {
                let (Some(local), Some(remote), Some(mapping)) =
                    (&pair.local, &pair.remote, &pair.mapping)
                else {
                    return None;
                };
                let resolution = self.resolver.resolve(
                    local,
                    remote,
                    mapping,
                    pair.direction,
                    policy.conflict_preference,
                );
                debug!(
                    mapping_id = %mapping.id,
                    winner = %resolution.winner,
                    reason = ?resolution.reason,
                    "Conflict resolved"
                );
                let action = match resolution.winner {
                    Side::Local => ActionKind::PushUpdate,
                    Side::Remote => ActionKind::PullUpdate,
                };
                return Some((action, Some(resolution)));
            }
            ChangeState::CreateRemote => ActionKind::PushCreate,
            ChangeState::CreateLocal => ActionKind::PullCreate,
            ChangeState::DeleteRemote => ActionKind::PushDelete,
            ChangeState::DeleteLocal => ActionKind::PullDelete,
            ChangeState::BothDeleted => ActionKind::Retire,
        };
        Some((action, None))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn execute(&self, job: Job, ctx: &ApplyContext<'_>) -> JobOutcome {
        let Job { seq, mut action, pair } = job;

        if ctx.abort.is_cancelled() {
            action.status = ActionStatus::Cancelled;
            let error = EntityError::new(
                EntityErrorKind::Cancelled,
                action.entity_label(),
                "run cancelled before this action started",
            )
            .with_mapping_id(action.mapping_id.clone());
            return JobOutcome {
                seq,
                action,
                error: Some(error),
                fatal: None,
            };
        }

        debug!(action = action.action.as_str(), entity = %action.entity_label(), "Applying");
        let result = match action.action {
            ActionKind::PushCreate | ActionKind::PullCreate => {
                self.apply_create(&action, &pair, ctx).await
            }
            ActionKind::PushUpdate | ActionKind::PullUpdate => {
                self.apply_update(&action, &pair, ctx).await
            }
            ActionKind::PushDelete | ActionKind::PullDelete => {
                self.apply_delete(&action, &pair, ctx).await
            }
            ActionKind::Retire => self.retire(&pair, ctx).await,
            ActionKind::Relink => self.relink(&pair, ctx).await,
        };

        match result {
            Ok(()) => {
                action.status = ActionStatus::Applied;
                JobOutcome {
                    seq,
                    action,
                    error: None,
                    fatal: None,
                }
            }
            Err(error) => {
                action.status = ActionStatus::Failed;
                warn!(
                    action = action.action.as_str(),
                    entity = %action.entity_label(),
                    error = %error,
                    "Action failed"
                );

                let side = action.action.target();
                let mapping_id = action.mapping_id.clone();
                let entity_id = action.entity_label();
                let (item, fatal) = match error {
                    SyncError::Apply {
                        message,
                        transient,
                        attempts,
                        ..
                    } => {
                        let kind = if transient {
                            EntityErrorKind::ApplyTransient
                        } else {
                            EntityErrorKind::ApplyPermanent
                        };
                        (
                            EntityError::new(kind, entity_id, message).with_attempts(attempts),
                            None,
                        )
                    }
                    fatal @ SyncError::MappingConsistency { .. } => {
                        ctx.abort.cancel();
                        (
                            EntityError::new(
                                EntityErrorKind::ApplyPermanent,
                                entity_id,
                                fatal.to_string(),
                            ),
                            Some(fatal),
                        )
                    }
                    other => (
                        EntityError::new(EntityErrorKind::ApplyPermanent, entity_id, other.to_string()),
                        None,
                    ),
                };

                let item = item.with_mapping_id(mapping_id);
                let item = match side {
                    Some(side) => item.with_side(side),
                    None => item,
                };
                JobOutcome {
                    seq,
                    action,
                    error: Some(item),
                    fatal,
                }
            }
        }
    }

    /// Copy the source entity to a side where it does not exist yet
    async fn apply_create(
        &self,
        action: &PlannedAction,
        pair: &ClassifiedPair,
        ctx: &ApplyContext<'_>,
    ) -> Result<()> {
        let target_side = target_side(action)?;
        let source_side = target_side.opposite();
        let source = live_entity(pair, source_side)?;
        let now = self.clock.now();

        let mut record = match &pair.mapping {
            Some(existing) => existing.clone(),
            None => {
                let pending = MappingRecord::pending(ctx.kind, source_side, &source.id, now)
                    .with_direction_hint(direction_hint(pair.direction))
                    .with_content_key(source.content_key.clone());
                self.commit(ctx, pending.clone()).await?;
                pending
            }
        };

        let adapter = ctx.target.adapter(target_side);
        let stamp = self.resolver.post_write_stamp(source, adapter.capabilities());
        let request = ApplyRequest::new(source.payload.clone()).with_modified_at(stamp.request_modified_at);
        let request = &request;
        let kind = ctx.kind;

        let (receipt, attempts) = call_with_retry(&self.retry, move || adapter.apply_create(kind, request))
            .await
            .map_err(|failure| apply_error(&source.id, failure))?;
        debug!(id = %receipt.id, attempts, "Create applied");

        record.observe(
            source_side,
            source.id.clone(),
            source.fingerprint.clone(),
            source.modified_at,
        );
        record.observe(
            target_side,
            receipt.id.clone(),
            stamp.fingerprint.clone(),
            stamp.committed_modified_at(&receipt),
        );
        record.content_key = source.content_key.clone();
        record.direction_hint = direction_hint(pair.direction);
        record.conflict_streak = 0;
        record.last_synced_at = self.clock.now();
        self.commit(ctx, record).await
    }

    /// Overwrite the target with the source entity
    async fn apply_update(
        &self,
        action: &PlannedAction,
        pair: &ClassifiedPair,
        ctx: &ApplyContext<'_>,
    ) -> Result<()> {
        let target_side = target_side(action)?;
        let source_side = target_side.opposite();
        let source = live_entity(pair, source_side)?;
        let mut record = mapping_of(pair)?.clone();
        let target_id = record
            .id_on(target_side)
            .map(str::to_string)
            .ok_or_else(|| missing(&source.id, &format!("mapping has no {} id", target_side)))?;

        let adapter = ctx.target.adapter(target_side);
        let stamp = self.resolver.post_write_stamp(source, adapter.capabilities());
        let request = ApplyRequest::new(source.payload.clone()).with_modified_at(stamp.request_modified_at);
        let request = &request;
        let target_id_ref = target_id.as_str();
        let kind = ctx.kind;

        let (receipt, attempts) = call_with_retry(&self.retry, move || {
            adapter.apply_update(kind, target_id_ref, request)
        })
        .await
        .map_err(|failure| apply_error(&source.id, failure))?;
        debug!(id = %target_id, attempts, "Update applied");

        let committed_id = if receipt.id.is_empty() {
            target_id.clone()
        } else {
            receipt.id.clone()
        };
        record.observe(
            source_side,
            source.id.clone(),
            source.fingerprint.clone(),
            source.modified_at,
        );
        record.observe(
            target_side,
            committed_id,
            stamp.fingerprint.clone(),
            stamp.committed_modified_at(&receipt),
        );
        record.conflict_streak = if action.resolution.is_some() {
            record.conflict_streak.saturating_add(1)
        } else {
            0
        };
        record.direction_hint = direction_hint(pair.direction);
        record.last_synced_at = self.clock.now();
        self.commit(ctx, record).await
    }

    /// Delete the counterpart of an entity deleted on the other side
    async fn apply_delete(
        &self,
        action: &PlannedAction,
        pair: &ClassifiedPair,
        ctx: &ApplyContext<'_>,
    ) -> Result<()> {
        let target_side = target_side(action)?;
        let record = mapping_of(pair)?;
        let target_id = record
            .id_on(target_side)
            .ok_or_else(|| missing(&record.id.to_string(), &format!("mapping has no {} id", target_side)))?;

        let adapter = ctx.target.adapter(target_side);
        let kind = ctx.kind;
        match call_with_retry(&self.retry, move || adapter.apply_delete(kind, target_id)).await {
            Ok(((), attempts)) => debug!(id = %target_id, attempts, "Delete applied"),
            Err(ApplyFailure {
                error: BridgeError::NotFound(_),
                ..
            }) => debug!(id = %target_id, "Already deleted on target"),
            Err(failure) => return Err(apply_error(target_id, failure)),
        }

        self.tombstone(ctx, record.retired(self.clock.now())).await
    }

    /// Both sides are gone; keep the mapping as a tombstone
    async fn retire(&self, pair: &ClassifiedPair, ctx: &ApplyContext<'_>) -> Result<()> {
        let record = mapping_of(pair)?;
        self.tombstone(ctx, record.retired(self.clock.now())).await
    }

    /// Rewrite ids and baselines of a pair whose content already matches
    async fn relink(&self, pair: &ClassifiedPair, ctx: &ApplyContext<'_>) -> Result<()> {
        let local = live_entity(pair, Side::Local)?;
        let remote = live_entity(pair, Side::Remote)?;
        let now = self.clock.now();

        let mut record = match &pair.mapping {
            Some(existing) => existing.clone(),
            None => MappingRecord::pending(ctx.kind, Side::Local, &local.id, now),
        };
        record.observe(Side::Local, local.id.clone(), local.fingerprint.clone(), local.modified_at);
        record.observe(Side::Remote, remote.id.clone(), remote.fingerprint.clone(), remote.modified_at);
        record.content_key = local.content_key.clone().or_else(|| remote.content_key.clone());
        record.direction_hint = direction_hint(pair.direction);
        record.conflict_streak = 0;
        record.last_synced_at = now;

        debug!(mapping_id = %record.id, local = %local.id, remote = %remote.id, "Relinking pair");
        self.commit(ctx, record).await
    }

    async fn commit(&self, ctx: &ApplyContext<'_>, record: MappingRecord) -> Result<()> {
        let mut partition = ctx.partition.lock().await;
        partition.upsert(record).await
    }

    async fn tombstone(&self, ctx: &ApplyContext<'_>, record: MappingRecord) -> Result<()> {
        let mut partition = ctx.partition.lock().await;
        partition.tombstone(record).await
    }
}

/// Ids whose records were listed but could not be normalized
///
/// Such an entity still exists on its side, so a mapping pointing at it must
/// not be read as a deletion.
struct UnreadableIds {
    local: HashSet<String>,
    remote: HashSet<String>,
}

impl UnreadableIds {
    fn from_errors(errors: &[EntityError]) -> Self {
        let mut ids = Self {
            local: HashSet::new(),
            remote: HashSet::new(),
        };
        for error in errors.iter().filter(|e| e.kind == EntityErrorKind::Normalization) {
            match error.side {
                Some(Side::Local) => ids.local.insert(error.entity_id.clone()),
                Some(Side::Remote) => ids.remote.insert(error.entity_id.clone()),
                None => false,
            };
        }
        ids
    }

    fn hides(&self, pair: &ClassifiedPair) -> bool {
        let Some(mapping) = &pair.mapping else {
            return false;
        };
        let unreadable = |entity: Option<&NormalizedEntity>, id: Option<&str>, ids: &HashSet<String>| {
            entity.is_none() && id.is_some_and(|id| ids.contains(id))
        };
        let hidden = unreadable(pair.local.as_ref(), mapping.local_id.as_deref(), &self.local)
            || unreadable(pair.remote.as_ref(), mapping.remote_id.as_deref(), &self.remote);
        if hidden {
            debug!(mapping_id = %mapping.id, state = %pair.state, "Skipping pair with an unreadable entity");
        }
        hidden
    }
}

fn direction_hint(direction: SyncDirection) -> Option<SyncDirection> {
    match direction {
        SyncDirection::Bidirectional => None,
        other => Some(other),
    }
}

fn target_side(action: &PlannedAction) -> Result<Side> {
    action
        .action
        .target()
        .ok_or_else(|| missing(&action.entity_label(), "action has no target side"))
}

fn live_entity(pair: &ClassifiedPair, side: Side) -> Result<&NormalizedEntity> {
    pair.entity(side).ok_or_else(|| {
        let label = pair
            .local_id()
            .or_else(|| pair.remote_id())
            .unwrap_or_default();
        missing(&label, &format!("no live {} entity", side))
    })
}

fn mapping_of(pair: &ClassifiedPair) -> Result<&MappingRecord> {
    pair.mapping.as_ref().ok_or_else(|| {
        let label = pair
            .local_id()
            .or_else(|| pair.remote_id())
            .unwrap_or_default();
        missing(&label, "pair has no mapping")
    })
}

fn missing(entity: &str, message: &str) -> SyncError {
    SyncError::Apply {
        entity: entity.to_string(),
        message: message.to_string(),
        transient: false,
        attempts: 0,
    }
}

fn apply_error(entity: &str, failure: ApplyFailure) -> SyncError {
    SyncError::Apply {
        entity: entity.to_string(),
        message: failure.error.to_string(),
        transient: failure.is_transient(),
        attempts: failure.attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::store::{MappingPartitions, SqliteMappingStore};
    use async_trait::async_trait;
    use bridge_traits::{NoteRecord, SystemClock, WriteReceipt};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Minimal adapter that stores notes in a map
    #[derive(Default)]
    struct MapAdapter {
        name: &'static str,
        records: StdMutex<HashMap<String, NoteRecord>>,
        next_id: StdMutex<u32>,
    }

    impl MapAdapter {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        fn put(&self, id: &str, title: &str) {
            self.records.lock().unwrap().insert(
                id.to_string(),
                NoteRecord {
                    id: Some(id.to_string()),
                    title: Some(title.to_string()),
                    ..Default::default()
                },
            );
        }

        fn titles(&self) -> Vec<String> {
            let mut titles: Vec<String> = self
                .records
                .lock()
                .unwrap()
                .values()
                .filter_map(|r| r.title.clone())
                .collect();
            titles.sort();
            titles
        }
    }

    #[async_trait]
    impl EntityAdapter for MapAdapter {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_snapshot(&self, _kind: EntityKind) -> bridge_traits::error::Result<Vec<RawRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .cloned()
                .map(RawRecord::Note)
                .collect())
        }

        async fn apply_create(
            &self,
            _kind: EntityKind,
            request: &ApplyRequest,
        ) -> bridge_traits::error::Result<WriteReceipt> {
            let RawRecord::Note(note) = &request.payload else {
                return Err(BridgeError::Permanent("not a note".into()));
            };
            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("{}-{}", self.name, next)
            };
            let mut stored = note.clone();
            stored.id = Some(id.clone());
            self.records.lock().unwrap().insert(id.clone(), stored);
            Ok(WriteReceipt::new(id))
        }

        async fn apply_update(
            &self,
            _kind: EntityKind,
            id: &str,
            request: &ApplyRequest,
        ) -> bridge_traits::error::Result<WriteReceipt> {
            let RawRecord::Note(note) = &request.payload else {
                return Err(BridgeError::Permanent("not a note".into()));
            };
            let mut stored = note.clone();
            stored.id = Some(id.to_string());
            self.records.lock().unwrap().insert(id.to_string(), stored);
            Ok(WriteReceipt::new(id))
        }

        async fn apply_delete(&self, _kind: EntityKind, id: &str) -> bridge_traits::error::Result<()> {
            self.records
                .lock()
                .unwrap()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| BridgeError::NotFound(id.to_string()))
        }
    }

    async fn setup() -> (MappingPartitions, ReconciliationDriver, Arc<MapAdapter>, Arc<MapAdapter>) {
        let pool = create_test_pool().await.unwrap();
        let partitions = MappingPartitions::new(Arc::new(SqliteMappingStore::new(pool)));
        let driver = ReconciliationDriver::new(ReconcileConfig::default(), Arc::new(SystemClock));
        (
            partitions,
            driver,
            Arc::new(MapAdapter::named("local")),
            Arc::new(MapAdapter::named("remote")),
        )
    }

    #[tokio::test]
    async fn test_run_creates_then_converges() {
        let (partitions, driver, local, remote) = setup().await;
        local.put("l1", "Groceries");
        remote.put("r1", "Packing list");
        let target = SyncTarget::new(local.clone(), remote.clone());
        let policy = KindPolicy::default_for(EntityKind::Note);

        let mut partition = partitions.acquire(EntityKind::Note).await.unwrap();
        let first = driver
            .run(&mut partition, &target, &policy, &RunOptions::new(false))
            .await
            .unwrap();
        assert_eq!(first.counts.create_remote, 1);
        assert_eq!(first.counts.create_local, 1);
        assert_eq!(first.applied, 2);
        assert!(first.is_clean());
        assert_eq!(local.titles(), remote.titles());

        let second = driver
            .run(&mut partition, &target, &policy, &RunOptions::new(false))
            .await
            .unwrap();
        assert_eq!(second.counts.changes(), 0);
        assert!(second.actions.is_empty());
        assert_eq!(second.counts.unchanged, 2);
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_writing() {
        let (partitions, driver, local, remote) = setup().await;
        local.put("l1", "Draft");
        let target = SyncTarget::new(local.clone(), remote.clone());
        let policy = KindPolicy::default_for(EntityKind::Note);

        let mut partition = partitions.acquire(EntityKind::Note).await.unwrap();
        let report = driver
            .run(&mut partition, &target, &policy, &RunOptions::new(true))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action, ActionKind::PushCreate);
        assert_eq!(report.actions[0].status, ActionStatus::Planned);
        assert_eq!(report.applied, 0);
        assert!(remote.titles().is_empty());
        assert!(partition.index().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_unstarted_actions() {
        let (partitions, driver, local, remote) = setup().await;
        local.put("l1", "One");
        local.put("l2", "Two");
        let target = SyncTarget::new(local.clone(), remote.clone());
        let policy = KindPolicy::default_for(EntityKind::Note);

        let options = RunOptions::new(false);
        options.cancel.cancel();

        let mut partition = partitions.acquire(EntityKind::Note).await.unwrap();
        let report = driver.run(&mut partition, &target, &policy, &options).await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.errors_of(EntityErrorKind::Cancelled).count(), 2);
        assert!(remote.titles().is_empty());
    }

    mockall::mock! {
        Adapter {}

        #[async_trait]
        impl EntityAdapter for Adapter {
            fn name(&self) -> &str;
            async fn fetch_snapshot(&self, kind: EntityKind) -> bridge_traits::error::Result<Vec<RawRecord>>;
            async fn apply_create(
                &self,
                kind: EntityKind,
                request: &ApplyRequest,
            ) -> bridge_traits::error::Result<WriteReceipt>;
            async fn apply_update(
                &self,
                kind: EntityKind,
                id: &str,
                request: &ApplyRequest,
            ) -> bridge_traits::error::Result<WriteReceipt>;
            async fn apply_delete(&self, kind: EntityKind, id: &str) -> bridge_traits::error::Result<()>;
        }
    }

    #[tokio::test]
    async fn test_snapshot_failure_aborts_before_any_apply() {
        let (partitions, driver, local, _) = setup().await;
        local.put("l1", "Groceries");

        let mut remote = MockAdapter::new();
        remote.expect_name().return_const("caldav".to_string());
        remote
            .expect_fetch_snapshot()
            .times(1)
            .returning(|_| Err(BridgeError::NotAvailable("server unreachable".into())));
        remote.expect_apply_create().never();
        remote.expect_apply_update().never();
        remote.expect_apply_delete().never();

        let target = SyncTarget::new(local.clone(), Arc::new(remote));
        let policy = KindPolicy::default_for(EntityKind::Note);
        let mut partition = partitions.acquire(EntityKind::Note).await.unwrap();

        let result = driver
            .run(&mut partition, &target, &policy, &RunOptions::new(false))
            .await;

        assert!(matches!(result, Err(SyncError::Snapshot { .. })));
        assert!(partition.index().is_empty());
    }

    #[tokio::test]
    async fn test_transient_create_failures_are_retried() {
        let (partitions, _, local, _) = setup().await;
        local.put("l1", "Groceries");
        let driver = ReconciliationDriver::new(
            ReconcileConfig {
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(2),
                ..Default::default()
            },
            Arc::new(SystemClock),
        );

        let mut remote = MockAdapter::new();
        remote.expect_name().return_const("caldav".to_string());
        remote.expect_fetch_snapshot().returning(|_| Ok(Vec::new()));
        let mut attempts = 0;
        remote.expect_apply_create().times(3).returning(move |_, _| {
            attempts += 1;
            if attempts < 3 {
                Err(BridgeError::Transient("503".into()))
            } else {
                Ok(WriteReceipt::new("r1"))
            }
        });

        let target = SyncTarget::new(local.clone(), Arc::new(remote));
        let policy = KindPolicy::default_for(EntityKind::Note);
        let mut partition = partitions.acquire(EntityKind::Note).await.unwrap();

        let report = driver
            .run(&mut partition, &target, &policy, &RunOptions::new(false))
            .await
            .unwrap();

        assert_eq!(report.applied, 1);
        assert!(report.is_clean());
        assert!(partition.index().get_by_remote("r1").is_some());
    }

    #[test]
    fn test_direction_hint_only_for_one_way_pairs() {
        assert_eq!(direction_hint(SyncDirection::Bidirectional), None);
        assert_eq!(
            direction_hint(SyncDirection::LocalAuthoritative),
            Some(SyncDirection::LocalAuthoritative)
        );
    }
}
