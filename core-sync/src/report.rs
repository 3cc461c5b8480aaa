//! # Run Report
//!
//! Structured summary of one reconciliation run. This is the only surface the
//! API layer, scheduler and notifications consume.

use crate::classifier::ChangeState;
use crate::entity::Side;
use crate::resolver::Resolution;
use bridge_traits::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of pairs per classification outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationCounts {
    pub unchanged: u64,
    pub local_modified: u64,
    pub remote_modified: u64,
    pub conflict: u64,
    pub create_remote: u64,
    pub create_local: u64,
    pub delete_remote: u64,
    pub delete_local: u64,
    pub both_deleted: u64,
    /// Pairs held back as classification ambiguities
    pub review_required: u64,
    /// Outcomes forced to `unchanged` by a one-directional policy
    pub coerced: u64,
}

impl ClassificationCounts {
    pub fn record(&mut self, state: ChangeState) {
        let slot = match state {
            ChangeState::Unchanged => &mut self.unchanged,
            ChangeState::LocalModified => &mut self.local_modified,
            ChangeState::RemoteModified => &mut self.remote_modified,
            ChangeState::Conflict => &mut self.conflict,
            ChangeState::CreateRemote => &mut self.create_remote,
            ChangeState::CreateLocal => &mut self.create_local,
            ChangeState::DeleteRemote => &mut self.delete_remote,
            ChangeState::DeleteLocal => &mut self.delete_local,
            ChangeState::BothDeleted => &mut self.both_deleted,
        };
        *slot += 1;
    }

    pub fn get(&self, state: ChangeState) -> u64 {
        match state {
            ChangeState::Unchanged => self.unchanged,
            ChangeState::LocalModified => self.local_modified,
            ChangeState::RemoteModified => self.remote_modified,
            ChangeState::Conflict => self.conflict,
            ChangeState::CreateRemote => self.create_remote,
            ChangeState::CreateLocal => self.create_local,
            ChangeState::DeleteRemote => self.delete_remote,
            ChangeState::DeleteLocal => self.delete_local,
            ChangeState::BothDeleted => self.both_deleted,
        }
    }

    /// Pairs whose state calls for a write on either side
    pub fn changes(&self) -> u64 {
        self.local_modified
            + self.remote_modified
            + self.conflict
            + self.create_remote
            + self.create_local
            + self.delete_remote
            + self.delete_local
    }
}

/// Operation the driver issues for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create the local entity on the remote
    PushCreate,
    /// Create the remote entity locally
    PullCreate,
    PushUpdate,
    PullUpdate,
    /// Delete the remote counterpart of a deleted local entity
    PushDelete,
    /// Delete the local counterpart of a deleted remote entity
    PullDelete,
    /// Both sides gone; tombstone the mapping
    Retire,
    /// Update mapping ids or baselines without touching either side
    Relink,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PushCreate => "push_create",
            ActionKind::PullCreate => "pull_create",
            ActionKind::PushUpdate => "push_update",
            ActionKind::PullUpdate => "pull_update",
            ActionKind::PushDelete => "push_delete",
            ActionKind::PullDelete => "pull_delete",
            ActionKind::Retire => "retire",
            ActionKind::Relink => "relink",
        }
    }

    /// Side whose adapter receives the apply call, if any
    pub fn target(&self) -> Option<Side> {
        match self {
            ActionKind::PushCreate | ActionKind::PushUpdate | ActionKind::PushDelete => {
                Some(Side::Remote)
            }
            ActionKind::PullCreate | ActionKind::PullUpdate | ActionKind::PullDelete => {
                Some(Side::Local)
            }
            ActionKind::Retire | ActionKind::Relink => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Dry run: not executed
    Planned,
    Applied,
    Failed,
    Cancelled,
}

/// One intended or executed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: ActionKind,
    pub state: ChangeState,
    pub mapping_id: Option<String>,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    /// Set when the action came out of conflict resolution
    pub resolution: Option<Resolution>,
    pub status: ActionStatus,
}

impl PlannedAction {
    /// Identifier used in logs and error items
    pub fn entity_label(&self) -> String {
        match (&self.local_id, &self.remote_id) {
            (Some(local), Some(remote)) => format!("{} <-> {}", local, remote),
            (Some(local), None) => local.clone(),
            (None, Some(remote)) => remote.clone(),
            (None, None) => self.mapping_id.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityErrorKind {
    Normalization,
    ReviewRequired,
    ApplyTransient,
    ApplyPermanent,
    Cancelled,
}

/// Per-entity failure item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    /// Side the identifier belongs to, when it is one-sided
    pub side: Option<Side>,
    pub entity_id: String,
    pub mapping_id: Option<String>,
    pub message: String,
    /// Apply attempts made before giving up
    pub attempts: u32,
}

impl EntityError {
    pub fn new(kind: EntityErrorKind, entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            side: None,
            entity_id: entity_id.into(),
            mapping_id: None,
            message: message.into(),
            attempts: 0,
        }
    }

    pub fn normalization(side: Side, entity_id: &str, message: &str) -> Self {
        Self::new(EntityErrorKind::Normalization, entity_id, message).with_side(side)
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn with_mapping_id(mut self, mapping_id: Option<String>) -> Self {
        self.mapping_id = mapping_id;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Transient failures are expected to clear on a later run
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            EntityErrorKind::ApplyTransient | EntityErrorKind::Cancelled
        )
    }
}

/// Summary of one reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub kind: EntityKind,
    pub dry_run: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: ClassificationCounts,
    pub actions: Vec<PlannedAction>,
    /// Actions that completed, including their mapping commit
    pub applied: u64,
    pub errors: Vec<EntityError>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, kind: EntityKind, dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            dry_run,
            cancelled: false,
            started_at,
            finished_at: None,
            counts: ClassificationCounts::default(),
            actions: Vec::new(),
            applied: 0,
            errors: Vec::new(),
        }
    }

    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn failed(&self) -> u64 {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .count() as u64
    }

    pub fn skipped(&self) -> u64 {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Cancelled)
            .count() as u64
    }

    pub fn errors_of(&self, kind: EntityErrorKind) -> impl Iterator<Item = &EntityError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    /// No errors and nothing left undone
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_record_and_changes() {
        let mut counts = ClassificationCounts::default();
        counts.record(ChangeState::Unchanged);
        counts.record(ChangeState::Unchanged);
        counts.record(ChangeState::LocalModified);
        counts.record(ChangeState::CreateLocal);
        counts.record(ChangeState::BothDeleted);

        assert_eq!(counts.get(ChangeState::Unchanged), 2);
        assert_eq!(counts.changes(), 2);
        assert_eq!(counts.both_deleted, 1);
    }

    #[test]
    fn test_action_targets() {
        assert_eq!(ActionKind::PushUpdate.target(), Some(Side::Remote));
        assert_eq!(ActionKind::PullDelete.target(), Some(Side::Local));
        assert_eq!(ActionKind::Relink.target(), None);
    }

    #[test]
    fn test_report_summary_helpers() {
        let started = Utc::now();
        let mut report = RunReport::new("run-1", EntityKind::Note, false, started);
        report.actions.push(PlannedAction {
            action: ActionKind::PushCreate,
            state: ChangeState::CreateRemote,
            mapping_id: None,
            local_id: Some("n1".to_string()),
            remote_id: None,
            resolution: None,
            status: ActionStatus::Failed,
        });
        report.errors.push(
            EntityError::new(EntityErrorKind::ApplyTransient, "n1", "timeout").with_attempts(3),
        );
        report.finish(started + chrono::Duration::milliseconds(1500));

        assert_eq!(report.failed(), 1);
        assert_eq!(report.duration_ms(), 1500);
        assert_eq!(report.errors_of(EntityErrorKind::ApplyTransient).count(), 1);
        assert!(report.errors[0].is_retryable());
        assert!(!report.is_clean());
        assert_eq!(report.actions[0].entity_label(), "n1");
    }

    #[test]
    fn test_report_serializes_snake_case() {
        let report = RunReport::new("run-2", EntityKind::Photo, true, Utc::now());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "photo");
        assert_eq!(json["dry_run"], true);

        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
