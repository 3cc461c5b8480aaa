//! # Change Classifier
//!
//! Assigns every mapped pair and every unmapped entity exactly one
//! [`ChangeState`].
//!
//! ## Overview
//!
//! Fingerprint comparison against the mapping's last-synced fingerprints is
//! the only change signal; timestamps are left to the resolver. A mapped
//! entity that is missing from its snapshot, or present with its tombstone
//! flag set, counts as deleted on that side.
//!
//! For asset kinds the content key is consulted before identifiers:
//!
//! - a mapped asset that vanished from its id but reappears under another id
//!   with identical content is relinked, not deleted and recreated
//! - an unmapped asset whose content is already tracked is a duplicate copy
//!   and needs nothing
//! - unmapped assets with identical content on both sides are paired
//!
//! A pending record (a create that was never committed) first looks for an
//! unmapped entity on the other side with the same fingerprint: that is the
//! copy an interrupted create already wrote, and it is adopted.
//!
//! Pairs that cannot be decided safely (deleted on one side while edited on
//! the other, or conflicting again after `oscillation_threshold` consecutive
//! resolutions) become [`ReviewItem`]s and are never applied.
//!
//! One-directional pairs never produce outcomes that would write to their
//! protected side; such outcomes are coerced to `unchanged` and logged.

use crate::dedup::ContentKey;
use crate::entity::{Fingerprint, NormalizedEntity, Side};
use crate::error::SyncError;
use crate::mapping::{MappingId, MappingIndex, MappingRecord};
use crate::report::ClassificationCounts;
use bridge_traits::{EntityKind, SyncDirection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Classification outcome for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Unchanged,
    LocalModified,
    RemoteModified,
    Conflict,
    CreateRemote,
    CreateLocal,
    DeleteRemote,
    DeleteLocal,
    BothDeleted,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Unchanged => "unchanged",
            ChangeState::LocalModified => "local_modified",
            ChangeState::RemoteModified => "remote_modified",
            ChangeState::Conflict => "conflict",
            ChangeState::CreateRemote => "create_remote",
            ChangeState::CreateLocal => "create_local",
            ChangeState::DeleteRemote => "delete_remote",
            ChangeState::DeleteLocal => "delete_local",
            ChangeState::BothDeleted => "both_deleted",
        }
    }

    /// Whether `direction` forbids this outcome
    pub fn is_blocked_by(&self, direction: SyncDirection) -> bool {
        match direction {
            SyncDirection::Bidirectional => false,
            SyncDirection::LocalAuthoritative => matches!(
                self,
                ChangeState::CreateLocal | ChangeState::DeleteLocal | ChangeState::RemoteModified
            ),
            SyncDirection::RemoteAuthoritative => matches!(
                self,
                ChangeState::CreateRemote | ChangeState::DeleteRemote | ChangeState::LocalModified
            ),
        }
    }
}

impl fmt::Display for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified pair
#[derive(Debug, Clone)]
pub struct ClassifiedPair {
    pub state: ChangeState,
    /// Current live local entity, if any
    pub local: Option<NormalizedEntity>,
    /// Current live remote entity, if any
    pub remote: Option<NormalizedEntity>,
    /// Mapping this pair was classified against
    pub mapping: Option<MappingRecord>,
    /// Ids or baselines must be rewritten even though no side changes
    pub needs_relink: bool,
    /// The state was forced to `unchanged` by a one-directional policy
    pub coerced: bool,
    /// Effective direction for this pair
    pub direction: SyncDirection,
}

impl ClassifiedPair {
    fn new(
        state: ChangeState,
        local: Option<&NormalizedEntity>,
        remote: Option<&NormalizedEntity>,
        mapping: Option<&MappingRecord>,
        direction: SyncDirection,
    ) -> Self {
        Self {
            state,
            local: local.cloned(),
            remote: remote.cloned(),
            mapping: mapping.cloned(),
            needs_relink: false,
            coerced: false,
            direction,
        }
    }

    fn relinked(mut self) -> Self {
        self.needs_relink = true;
        self
    }

    pub fn local_id(&self) -> Option<String> {
        self.local
            .as_ref()
            .map(|e| e.id.clone())
            .or_else(|| self.mapping.as_ref().and_then(|m| m.local_id.clone()))
    }

    pub fn remote_id(&self) -> Option<String> {
        self.remote
            .as_ref()
            .map(|e| e.id.clone())
            .or_else(|| self.mapping.as_ref().and_then(|m| m.remote_id.clone()))
    }

    pub fn entity(&self, side: Side) -> Option<&NormalizedEntity> {
        match side {
            Side::Local => self.local.as_ref(),
            Side::Remote => self.remote.as_ref(),
        }
    }
}

/// A pair held back for a human decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewItem {
    pub mapping_id: Option<MappingId>,
    pub local_id: Option<String>,
    pub remote_id: Option<String>,
    pub reason: String,
}

impl ReviewItem {
    pub fn to_error(&self, kind: EntityKind) -> SyncError {
        SyncError::ClassificationAmbiguity {
            kind,
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Result of classifying one kind
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub pairs: Vec<ClassifiedPair>,
    pub reviews: Vec<ReviewItem>,
    /// Unchanged pairs still carrying a conflict streak
    pub settled: Vec<MappingRecord>,
}

impl Classification {
    pub fn counts(&self) -> ClassificationCounts {
        let mut counts = ClassificationCounts::default();
        for pair in &self.pairs {
            counts.record(pair.state);
            if pair.coerced {
                counts.coerced += 1;
            }
        }
        counts.review_required = self.reviews.len() as u64;
        counts
    }

    /// Pairs in `state`
    pub fn in_state(&self, state: ChangeState) -> impl Iterator<Item = &ClassifiedPair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }
}

/// Classifies snapshots against a kind's mappings
#[derive(Debug, Clone)]
pub struct ChangeClassifier {
    oscillation_threshold: u32,
}

impl ChangeClassifier {
    pub fn new(oscillation_threshold: u32) -> Self {
        Self {
            oscillation_threshold,
        }
    }

    /// Classify every mapped pair and every unmapped entity.
    ///
    /// `direction` is the kind's policy; a mapping's own direction hint takes
    /// precedence for that pair. Output order is deterministic: mapped pairs
    /// by mapping id, then unmapped local entities, then unmapped remote
    /// entities, each by id.
    pub fn classify(
        &self,
        kind: EntityKind,
        local: &[NormalizedEntity],
        remote: &[NormalizedEntity],
        index: &MappingIndex,
        direction: SyncDirection,
    ) -> Classification {
        let mut run = ClassificationRun::new(kind, local, remote, index, direction);

        for record in index.live_records() {
            run.classify_mapped(record, self.oscillation_threshold);
        }
        run.classify_unmapped(Side::Local);
        run.classify_unmapped(Side::Remote);

        let classification = run.finish();
        debug!(
            kind = %kind,
            pairs = classification.pairs.len(),
            reviews = classification.reviews.len(),
            "Classification complete"
        );
        classification
    }
}

// ============================================================================
// Classification pass
// ============================================================================

struct SideView<'a> {
    by_id: HashMap<&'a str, &'a NormalizedEntity>,
    /// Unmapped live entities per content key, ids ascending
    by_content: HashMap<&'a ContentKey, Vec<&'a NormalizedEntity>>,
    /// Unmapped live entities per fingerprint digest, ids ascending
    by_fingerprint: HashMap<&'a str, Vec<&'a NormalizedEntity>>,
    ordered: Vec<&'a NormalizedEntity>,
    consumed: HashSet<&'a str>,
}

impl<'a> SideView<'a> {
    fn new(entities: &'a [NormalizedEntity]) -> Self {
        let mut ordered: Vec<&NormalizedEntity> = entities.iter().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            by_id: ordered.iter().map(|e| (e.id.as_str(), *e)).collect(),
            by_content: HashMap::new(),
            by_fingerprint: HashMap::new(),
            ordered,
            consumed: HashSet::new(),
        }
    }

    fn index_unmapped(&mut self, side: Side, index: &MappingIndex, with_content: bool) {
        for entity in self.ordered.iter().copied() {
            if !entity.is_live() || index.get_by_side(side, &entity.id).is_some() {
                continue;
            }
            self.by_fingerprint
                .entry(entity.fingerprint.digest.as_str())
                .or_default()
                .push(entity);
            if let Some(key) = entity.content_key.as_ref().filter(|_| with_content) {
                self.by_content.entry(key).or_default().push(entity);
            }
        }
    }

    /// Live entity for a mapped id; the id is consumed either way
    fn take(&mut self, id: Option<&str>) -> Option<&'a NormalizedEntity> {
        let entity = *self.by_id.get(id?)?;
        self.consumed.insert(entity.id.as_str());
        entity.is_live().then_some(entity)
    }

    /// Unmapped live entity carrying `key`
    fn take_by_content(&mut self, key: &ContentKey) -> Option<&'a NormalizedEntity> {
        let candidates = self.by_content.get(key)?;
        let found = candidates
            .iter()
            .find(|e| !self.consumed.contains(e.id.as_str()))
            .copied()?;
        self.consumed.insert(found.id.as_str());
        Some(found)
    }

    /// Unmapped live entity with exactly this fingerprint
    fn take_by_fingerprint(&mut self, fingerprint: &Fingerprint) -> Option<&'a NormalizedEntity> {
        let candidates = self.by_fingerprint.get(fingerprint.digest.as_str())?;
        let found = candidates
            .iter()
            .find(|e| !self.consumed.contains(e.id.as_str()))
            .copied()?;
        self.consumed.insert(found.id.as_str());
        Some(found)
    }
}

struct ClassificationRun<'a> {
    kind: EntityKind,
    index: &'a MappingIndex,
    direction: SyncDirection,
    local: SideView<'a>,
    remote: SideView<'a>,
    output: Classification,
}

impl<'a> ClassificationRun<'a> {
    fn new(
        kind: EntityKind,
        local: &'a [NormalizedEntity],
        remote: &'a [NormalizedEntity],
        index: &'a MappingIndex,
        direction: SyncDirection,
    ) -> Self {
        let mut local = SideView::new(local);
        let mut remote = SideView::new(remote);
        local.index_unmapped(Side::Local, index, kind.is_asset());
        remote.index_unmapped(Side::Remote, index, kind.is_asset());

        Self {
            kind,
            index,
            direction,
            local,
            remote,
            output: Classification::default(),
        }
    }

    fn view(&mut self, side: Side) -> &mut SideView<'a> {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    fn classify_mapped(&mut self, record: &'a MappingRecord, oscillation_threshold: u32) {
        let direction = record.direction_hint.unwrap_or(self.direction);
        let mut relocated = false;

        let mut local = self.local.take(record.local_id.as_deref());
        let mut remote = self.remote.take(record.remote_id.as_deref());

        if let Some(key) = &record.content_key {
            if local.is_none() && record.local_id.is_some() {
                local = self.local.take_by_content(key);
                relocated |= local.is_some();
            }
            if remote.is_none() && record.remote_id.is_some() {
                remote = self.remote.take_by_content(key);
                relocated |= remote.is_some();
            }
        }

        if record.is_pending() {
            self.classify_pending(record, local, remote, direction);
            return;
        }

        let pair = |state| ClassifiedPair::new(state, local, remote, Some(record), direction);
        let classified = match (local, remote) {
            (None, None) => pair(ChangeState::BothDeleted),
            (None, Some(r)) => {
                if changed(r, record.last_fingerprint(Side::Remote)) {
                    self.review(record, "local deleted while remote was modified");
                    return;
                }
                pair(ChangeState::DeleteRemote)
            }
            (Some(l), None) => {
                if changed(l, record.last_fingerprint(Side::Local)) {
                    self.review(record, "remote deleted while local was modified");
                    return;
                }
                pair(ChangeState::DeleteLocal)
            }
            (Some(l), Some(r)) => {
                let local_changed = changed(l, record.last_fingerprint(Side::Local));
                let remote_changed = changed(r, record.last_fingerprint(Side::Remote));
                match (local_changed, remote_changed) {
                    (false, false) => {
                        if record.conflict_streak > 0 && !relocated {
                            self.output.settled.push(record.clone());
                        }
                        pair(ChangeState::Unchanged)
                    }
                    (true, false) => pair(ChangeState::LocalModified),
                    (false, true) => pair(ChangeState::RemoteModified),
                    (true, true) if l.fingerprint == r.fingerprint => {
                        // Both sides converged on the same content
                        pair(ChangeState::Unchanged).relinked()
                    }
                    (true, true) if record.conflict_streak >= oscillation_threshold => {
                        self.review(
                            record,
                            &format!(
                                "conflict oscillation: {} consecutive conflicting resolutions",
                                record.conflict_streak
                            ),
                        );
                        return;
                    }
                    (true, true) => pair(ChangeState::Conflict),
                }
            }
        };

        let classified = if relocated && !classified.needs_relink {
            debug!(mapping_id = %record.id, "Asset relocated, relinking");
            classified.relinked()
        } else {
            classified
        };
        self.push(classified);
    }

    /// A record written before a create whose commit never happened
    fn classify_pending(
        &mut self,
        record: &'a MappingRecord,
        local: Option<&'a NormalizedEntity>,
        remote: Option<&'a NormalizedEntity>,
        direction: SyncDirection,
    ) {
        let Some(source_side) = [Side::Local, Side::Remote]
            .into_iter()
            .find(|side| record.id_on(*side).is_some())
        else {
            return;
        };
        let source = match source_side {
            Side::Local => local,
            Side::Remote => remote,
        };

        let classified = match source {
            None => ClassifiedPair::new(ChangeState::BothDeleted, local, remote, Some(record), direction),
            Some(entity) => {
                // A create that landed before the crash left an unmapped copy
                let landed = self.view(source_side.opposite());
                let counterpart = match &entity.content_key {
                    Some(key) => landed.take_by_content(key),
                    None => None,
                }
                .or_else(|| landed.take_by_fingerprint(&entity.fingerprint));
                match (source_side, counterpart) {
                    // The earlier create landed; complete the pair
                    (Side::Local, Some(copy)) => {
                        ClassifiedPair::new(ChangeState::Unchanged, Some(entity), Some(copy), Some(record), direction)
                            .relinked()
                    }
                    (Side::Remote, Some(copy)) => {
                        ClassifiedPair::new(ChangeState::Unchanged, Some(copy), Some(entity), Some(record), direction)
                            .relinked()
                    }
                    (Side::Local, None) => {
                        ClassifiedPair::new(ChangeState::CreateRemote, Some(entity), None, Some(record), direction)
                    }
                    (Side::Remote, None) => {
                        ClassifiedPair::new(ChangeState::CreateLocal, None, Some(entity), Some(record), direction)
                    }
                }
            }
        };
        self.push(classified);
    }

    fn classify_unmapped(&mut self, side: Side) {
        let index = self.index;
        let entities: Vec<&'a NormalizedEntity> = self.view(side).ordered.clone();

        for entity in entities {
            if !entity.is_live() || self.view(side).consumed.contains(entity.id.as_str()) {
                continue;
            }
            self.view(side).consumed.insert(entity.id.as_str());

            if let Some(retired) = index.retired_by_side(side, &entity.id) {
                if retired.last_fingerprint(side) == Some(&entity.fingerprint) {
                    // Stale listing of an entity both sides already deleted
                    debug!(id = %entity.id, side = %side, "Ignoring retired entity");
                    self.push(ClassifiedPair::new(
                        ChangeState::Unchanged,
                        side_slot(side, Side::Local, entity),
                        side_slot(side, Side::Remote, entity),
                        Some(retired),
                        self.direction,
                    ));
                    continue;
                }
            }

            if let Some(key) = &entity.content_key {
                if let Some(existing) = index.get_by_content_key(key) {
                    debug!(id = %entity.id, side = %side, "Content already tracked, skipping duplicate");
                    self.push(ClassifiedPair::new(
                        ChangeState::Unchanged,
                        side_slot(side, Side::Local, entity),
                        side_slot(side, Side::Remote, entity),
                        Some(existing),
                        existing.direction_hint.unwrap_or(self.direction),
                    ));
                    continue;
                }

                if let Some(copy) = self.view(side.opposite()).take_by_content(key) {
                    let (local, remote) = match side {
                        Side::Local => (entity, copy),
                        Side::Remote => (copy, entity),
                    };
                    self.push(
                        ClassifiedPair::new(ChangeState::Unchanged, Some(local), Some(remote), None, self.direction)
                            .relinked(),
                    );
                    continue;
                }
            }

            let state = match side {
                Side::Local => ChangeState::CreateRemote,
                Side::Remote => ChangeState::CreateLocal,
            };
            self.push(ClassifiedPair::new(
                state,
                side_slot(side, Side::Local, entity),
                side_slot(side, Side::Remote, entity),
                None,
                self.direction,
            ));
        }
    }

    fn review(&mut self, record: &MappingRecord, reason: &str) {
        warn!(
            kind = %self.kind,
            mapping_id = %record.id,
            reason,
            "Pair requires review"
        );
        self.output.reviews.push(ReviewItem {
            mapping_id: Some(record.id),
            local_id: record.local_id.clone(),
            remote_id: record.remote_id.clone(),
            reason: reason.to_string(),
        });
    }

    fn push(&mut self, mut pair: ClassifiedPair) {
        if pair.state.is_blocked_by(pair.direction) {
            info!(
                kind = %self.kind,
                state = %pair.state,
                direction = pair.direction.as_str(),
                local_id = ?pair.local_id(),
                remote_id = ?pair.remote_id(),
                "Outcome blocked by sync direction, treating as unchanged"
            );
            pair.state = ChangeState::Unchanged;
            pair.coerced = true;
            pair.needs_relink = false;
        }
        self.output.pairs.push(pair);
    }

    fn finish(self) -> Classification {
        self.output
    }
}

fn changed(entity: &NormalizedEntity, baseline: Option<&Fingerprint>) -> bool {
    baseline != Some(&entity.fingerprint)
}

fn side_slot(side: Side, slot: Side, entity: &NormalizedEntity) -> Option<&NormalizedEntity> {
    (side == slot).then_some(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use bridge_traits::{NoteRecord, PhotoRecord, RawRecord};
    use bytes::Bytes;
    use chrono::Utc;

    fn note(side: Side, id: &str, title: &str) -> NormalizedEntity {
        let raw = RawRecord::Note(NoteRecord {
            id: Some(id.to_string()),
            title: Some(title.to_string()),
            body: Some("body".to_string()),
            ..Default::default()
        });
        normalize(&raw, EntityKind::Note, side).unwrap()
    }

    fn deleted_note(side: Side, id: &str) -> NormalizedEntity {
        let raw = RawRecord::Note(NoteRecord {
            id: Some(id.to_string()),
            deleted: true,
            ..Default::default()
        });
        normalize(&raw, EntityKind::Note, side).unwrap()
    }

    fn photo(side: Side, id: &str, bytes: &'static [u8]) -> NormalizedEntity {
        let raw = RawRecord::Photo(PhotoRecord {
            id: Some(id.to_string()),
            path: Some(id.to_string()),
            content: Some(Bytes::from_static(bytes)),
            ..Default::default()
        });
        normalize(&raw, EntityKind::Photo, side).unwrap()
    }

    fn synced(local: &NormalizedEntity, remote: &NormalizedEntity) -> MappingRecord {
        let mut record = MappingRecord::pending(local.kind, Side::Local, &local.id, Utc::now());
        record.observe(Side::Local, &local.id, local.fingerprint.clone(), None);
        record.observe(Side::Remote, &remote.id, remote.fingerprint.clone(), None);
        record.with_content_key(local.content_key.clone())
    }

    fn classify(
        local: &[NormalizedEntity],
        remote: &[NormalizedEntity],
        records: Vec<MappingRecord>,
        direction: SyncDirection,
    ) -> Classification {
        let kind = local.first().or(remote.first()).map(|e| e.kind).unwrap_or(EntityKind::Note);
        let index = MappingIndex::build(kind, records).unwrap();
        ChangeClassifier::new(3).classify(kind, local, remote, &index, direction)
    }

    fn states(classification: &Classification) -> Vec<ChangeState> {
        classification.pairs.iter().map(|p| p.state).collect()
    }

    #[test]
    fn test_fingerprint_states_for_mapped_pairs() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        let unchanged = classify(&[l.clone()], &[r.clone()], vec![mapping.clone()], SyncDirection::Bidirectional);
        assert_eq!(states(&unchanged), vec![ChangeState::Unchanged]);

        let local_edit = note(Side::Local, "l1", "b");
        let result = classify(&[local_edit.clone()], &[r.clone()], vec![mapping.clone()], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::LocalModified]);

        let remote_edit = note(Side::Remote, "r1", "c");
        let result = classify(&[l.clone()], &[remote_edit.clone()], vec![mapping.clone()], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::RemoteModified]);

        let result = classify(&[local_edit], &[remote_edit], vec![mapping], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::Conflict]);
    }

    #[test]
    fn test_timestamps_do_not_affect_classification() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        let mut touched = r.clone();
        touched.modified_at = Some(Utc::now());
        let result = classify(&[l], &[touched], vec![mapping], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
    }

    #[test]
    fn test_creation_is_symmetric_and_exclusive() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r9", "z");
        let result = classify(&[l], &[r], vec![], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::CreateRemote, ChangeState::CreateLocal]);
        assert_eq!(result.pairs[0].local_id().as_deref(), Some("l1"));
        assert!(result.pairs[0].remote.is_none());
        assert_eq!(result.pairs[1].remote_id().as_deref(), Some("r9"));
    }

    #[test]
    fn test_deletions_and_tombstones() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        // Missing from the local snapshot
        let result = classify(&[], &[r.clone()], vec![mapping.clone()], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::DeleteRemote]);

        // Tombstoned on the remote
        let result = classify(
            &[l.clone()],
            &[deleted_note(Side::Remote, "r1")],
            vec![mapping.clone()],
            SyncDirection::Bidirectional,
        );
        assert_eq!(states(&result), vec![ChangeState::DeleteLocal]);

        let result = classify(&[], &[], vec![mapping], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::BothDeleted]);
    }

    #[test]
    fn test_delete_against_edit_needs_review() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        let result = classify(
            &[],
            &[note(Side::Remote, "r1", "edited")],
            vec![mapping],
            SyncDirection::Bidirectional,
        );
        assert!(result.pairs.is_empty());
        assert_eq!(result.reviews.len(), 1);
        assert_eq!(result.counts().review_required, 1);
        assert!(matches!(
            result.reviews[0].to_error(EntityKind::Note),
            SyncError::ClassificationAmbiguity { .. }
        ));
    }

    #[test]
    fn test_oscillating_conflict_becomes_review() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mut mapping = synced(&l, &r);
        mapping.conflict_streak = 3;

        let result = classify(
            &[note(Side::Local, "l1", "b")],
            &[note(Side::Remote, "r1", "c")],
            vec![mapping],
            SyncDirection::Bidirectional,
        );
        assert!(result.pairs.is_empty());
        assert!(result.reviews[0].reason.contains("oscillation"));
    }

    #[test]
    fn test_converged_edits_are_relinked() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        let result = classify(
            &[note(Side::Local, "l1", "same")],
            &[note(Side::Remote, "r1", "same")],
            vec![mapping],
            SyncDirection::Bidirectional,
        );
        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
        assert!(result.pairs[0].needs_relink);
    }

    #[test]
    fn test_relocated_asset_is_unchanged() {
        let l = photo(Side::Local, "/a/IMG_1.jpg", b"pixels");
        let r = photo(Side::Remote, "r1", b"pixels");
        let mapping = synced(&l, &r);

        let moved = photo(Side::Local, "/b/IMG_1.jpg", b"pixels");
        let result = classify(&[moved], &[r], vec![mapping], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
        assert!(result.pairs[0].needs_relink);
        assert_eq!(result.pairs[0].local_id().as_deref(), Some("/b/IMG_1.jpg"));
    }

    #[test]
    fn test_duplicate_asset_copy_is_not_created() {
        let l = photo(Side::Local, "/a/IMG_1.jpg", b"pixels");
        let r = photo(Side::Remote, "r1", b"pixels");
        let mapping = synced(&l, &r);

        let copy = photo(Side::Local, "/backup/IMG_1.jpg", b"pixels");
        let result = classify(&[l, copy], &[r], vec![mapping], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::Unchanged, ChangeState::Unchanged]);
        assert_eq!(result.counts().create_remote, 0);
    }

    #[test]
    fn test_unmapped_assets_with_same_content_pair_up() {
        let l = photo(Side::Local, "/a/IMG_2.jpg", b"sunset");
        let r = photo(Side::Remote, "remote-2", b"sunset");
        let result = classify(&[l], &[r], vec![], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
        assert!(result.pairs[0].needs_relink);
        assert!(result.pairs[0].mapping.is_none());
    }

    #[test]
    fn test_local_authoritative_coerces_pull_outcomes() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r);

        let result = classify(
            &[l],
            &[note(Side::Remote, "r1", "remote edit"), note(Side::Remote, "r2", "new")],
            vec![mapping],
            SyncDirection::LocalAuthoritative,
        );
        assert_eq!(states(&result), vec![ChangeState::Unchanged, ChangeState::Unchanged]);
        assert_eq!(result.counts().coerced, 2);
        assert_eq!(result.counts().create_local, 0);
    }

    #[test]
    fn test_direction_hint_overrides_kind_policy() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mapping = synced(&l, &r).with_direction_hint(Some(SyncDirection::RemoteAuthoritative));

        let result = classify(
            &[note(Side::Local, "l1", "local edit")],
            &[r],
            vec![mapping],
            SyncDirection::Bidirectional,
        );
        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
        assert!(result.pairs[0].coerced);
    }

    #[test]
    fn test_stale_listing_of_retired_pair_is_ignored() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let retired = synced(&l, &r).retired(Utc::now());

        let result = classify(&[], &[r], vec![retired], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::Unchanged]);

        // An edited copy is new content and is created again
        let fresh = note(Side::Remote, "r1", "recreated");
        let l2 = note(Side::Local, "l1", "a");
        let retired = synced(&l2, &note(Side::Remote, "r1", "a")).retired(Utc::now());
        let result = classify(&[], &[fresh], vec![retired], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::CreateLocal]);
    }

    #[test]
    fn test_pending_record_is_recreated() {
        let l = note(Side::Local, "l1", "a");
        let pending = MappingRecord::pending(EntityKind::Note, Side::Local, "l1", Utc::now());
        let result = classify(&[l], &[], vec![pending.clone()], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::CreateRemote]);
        assert_eq!(result.pairs[0].mapping.as_ref().map(|m| m.id), Some(pending.id));
    }

    #[test]
    fn test_pending_record_adopts_landed_copy_by_fingerprint() {
        let l = note(Side::Local, "l1", "a");
        let landed = note(Side::Remote, "r9", "a");
        let unrelated = note(Side::Remote, "r5", "other");
        let pending = MappingRecord::pending(EntityKind::Note, Side::Local, "l1", Utc::now());

        let result = classify(&[l], &[landed, unrelated], vec![pending.clone()], SyncDirection::Bidirectional);

        assert_eq!(states(&result), vec![ChangeState::Unchanged, ChangeState::CreateLocal]);
        assert!(result.pairs[0].needs_relink);
        assert_eq!(result.pairs[0].remote_id().as_deref(), Some("r9"));
        assert_eq!(result.pairs[0].mapping.as_ref().map(|m| m.id), Some(pending.id));
        assert_eq!(result.pairs[1].remote_id().as_deref(), Some("r5"));
    }

    #[test]
    fn test_unchanged_pair_with_conflict_streak_is_settled() {
        let l = note(Side::Local, "l1", "a");
        let r = note(Side::Remote, "r1", "a");
        let mut streaky = synced(&l, &r);
        streaky.conflict_streak = 2;

        let result = classify(&[l.clone()], &[r.clone()], vec![streaky.clone()], SyncDirection::Bidirectional);
        assert_eq!(states(&result), vec![ChangeState::Unchanged]);
        assert!(!result.pairs[0].needs_relink);
        assert_eq!(result.settled.len(), 1);
        assert_eq!(result.settled[0].id, streaky.id);

        let calm = synced(&l, &r);
        let result = classify(&[l], &[r], vec![calm], SyncDirection::Bidirectional);
        assert!(result.settled.is_empty());
    }
}
