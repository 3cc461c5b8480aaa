//! # Entity Snapshot Normalizer
//!
//! The only place in the engine that looks inside adapter-specific records.
//!
//! ## Overview
//!
//! [`normalize`] turns a [`RawRecord`] into a [`NormalizedEntity`] with a
//! deterministic [`Fingerprint`]. Fingerprints cover only the fields a user
//! would recognise as content:
//!
//! - Notes: title, body, folder, tags (sorted, deduplicated)
//! - Reminders: title, notes, list, due date, completion, priority
//! - Photos: content hash only (never path or file name)
//! - Credentials: title, username, secret, url, notes
//!
//! Modification times, tombstone flags and adapter metadata (etags, internal
//! object ids, revision counters) are excluded, so a record that was merely
//! re-stamped by a write keeps its fingerprint.

use crate::dedup::{identify, AssetSource, ContentKey};
use crate::entity::{Fingerprint, NormalizedEntity, Side};
use crate::error::{Result, SyncError};
use crate::report::EntityError;
use bridge_traits::{
    CredentialRecord, EntityKind, NoteRecord, PhotoRecord, RawRecord, ReminderRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Normalize one raw record.
///
/// # Arguments
///
/// * `raw` - Record produced by an adapter
/// * `kind` - Kind the snapshot was requested for
/// * `side` - Which side the record came from
///
/// # Errors
///
/// Returns `SyncError::Normalization` when the record belongs to another
/// kind, has no id, or lacks a field its kind requires. Tombstoned records
/// only need an id.
pub fn normalize(raw: &RawRecord, kind: EntityKind, side: Side) -> Result<NormalizedEntity> {
    let invalid = |entity: &str, message: &str| SyncError::Normalization {
        kind,
        entity: entity.to_string(),
        message: message.to_string(),
    };

    if raw.kind() != kind {
        return Err(invalid(
            raw.source_id().unwrap_or("<unknown>"),
            &format!("record of kind {} in {} snapshot", raw.kind(), kind),
        ));
    }

    let id = raw
        .source_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| invalid("<unknown>", "record has no id"))?
        .to_string();

    let (values, modified_at, deleted, content_key) = match raw {
        RawRecord::Note(note) => {
            if !note.deleted && note.title.is_none() && note.body.is_none() {
                return Err(invalid(&id, "note has neither title nor body"));
            }
            (note_fields(note), note.modified_at, note.deleted, None)
        }
        RawRecord::Reminder(reminder) => {
            if !reminder.deleted && blank(&reminder.title) {
                return Err(invalid(&id, "reminder has no title"));
            }
            (
                reminder_fields(reminder),
                reminder.modified_at,
                reminder.deleted,
                None,
            )
        }
        RawRecord::Photo(photo) => {
            let key = photo_content_key(photo).map_err(|message| invalid(&id, &message))?;
            if !photo.deleted && key.is_none() {
                return Err(invalid(&id, "photo has neither content nor content hash"));
            }
            (photo_fields(key.as_ref()), photo.modified_at, photo.deleted, key)
        }
        RawRecord::Credential(credential) => {
            if !credential.deleted && blank(&credential.title) {
                return Err(invalid(&id, "credential has no title"));
            }
            (
                credential_fields(credential),
                credential.modified_at,
                credential.deleted,
                None,
            )
        }
    };

    Ok(NormalizedEntity {
        id,
        side,
        kind,
        fingerprint: Fingerprint::from_fields(kind, values),
        modified_at,
        deleted,
        content_key,
        payload: raw.clone(),
    })
}

/// Hash the files behind photos that were listed by path only.
///
/// Photos carrying neither bytes nor a content hash get `content_hash` filled
/// in from the file at `path`. Photos whose file cannot be read are dropped
/// from the snapshot and reported, the same way a record that fails
/// normalization is. Other records pass through untouched.
pub async fn identify_asset_paths(
    records: Vec<RawRecord>,
    side: Side,
) -> (Vec<RawRecord>, Vec<EntityError>) {
    let mut identified = Vec::with_capacity(records.len());
    let mut errors = Vec::new();

    for mut raw in records {
        if let RawRecord::Photo(photo) = &mut raw {
            let needs_hash = !photo.deleted && photo.content.is_none() && photo.content_hash.is_none();
            if let Some(path) = photo.path.as_deref().filter(|_| needs_hash) {
                match identify(&AssetSource::Path(PathBuf::from(path))).await {
                    Ok(key) => photo.content_hash = Some(key.as_str().to_string()),
                    Err(e) => {
                        let id = photo.id.as_deref().unwrap_or("<unknown>");
                        warn!(side = %side, id, error = %e, "Cannot hash photo file, skipping");
                        errors.push(EntityError::normalization(side, id, &e.to_string()));
                        continue;
                    }
                }
            }
        }
        identified.push(raw);
    }

    (identified, errors)
}

/// Normalize a whole snapshot, collecting per-entity failures.
///
/// Records that fail normalization, and later records reusing an id already
/// seen in the same snapshot, are reported and skipped.
pub fn normalize_snapshot(
    records: &[RawRecord],
    kind: EntityKind,
    side: Side,
) -> (Vec<NormalizedEntity>, Vec<EntityError>) {
    let mut entities = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for raw in records {
        match normalize(raw, kind, side) {
            Ok(entity) => {
                if seen.insert(entity.id.clone()) {
                    entities.push(entity);
                } else {
                    warn!(side = %side, id = %entity.id, "Duplicate id in snapshot, skipping");
                    errors.push(EntityError::normalization(
                        side,
                        &entity.id,
                        "duplicate id in snapshot",
                    ));
                }
            }
            Err(e) => {
                warn!(side = %side, error = %e, "Skipping record that failed normalization");
                let entity_id = raw.source_id().unwrap_or("<unknown>");
                errors.push(EntityError::normalization(side, entity_id, &e.to_string()));
            }
        }
    }

    debug!(
        side = %side,
        kind = %kind,
        normalized = entities.len(),
        failed = errors.len(),
        "Snapshot normalized"
    );

    (entities, errors)
}

// ============================================================================
// Per-kind field extraction
// ============================================================================

fn note_fields(note: &NoteRecord) -> BTreeMap<&'static str, Value> {
    let tags: BTreeSet<String> = note
        .tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    BTreeMap::from([
        ("title", json!(note.title.as_deref().map(str::trim))),
        ("body", json!(note.body.as_deref().map(canonical_text))),
        ("folder", json!(note.folder.as_deref().map(str::trim))),
        ("tags", json!(tags)),
    ])
}

fn reminder_fields(reminder: &ReminderRecord) -> BTreeMap<&'static str, Value> {
    BTreeMap::from([
        ("title", json!(reminder.title.as_deref().map(str::trim))),
        ("notes", json!(reminder.notes.as_deref().map(canonical_text))),
        ("list", json!(reminder.list.as_deref().map(str::trim))),
        ("due_at", json!(reminder.due_at.map(canonical_instant))),
        ("completed", json!(reminder.completed)),
        ("priority", json!(reminder.priority)),
    ])
}

fn photo_fields(key: Option<&ContentKey>) -> BTreeMap<&'static str, Value> {
    BTreeMap::from([("content", json!(key.map(ContentKey::as_str)))])
}

fn credential_fields(credential: &CredentialRecord) -> BTreeMap<&'static str, Value> {
    // Only per-field digests leave this function; the secret is never stored
    BTreeMap::from([
        ("title", json!(credential.title.as_deref().map(str::trim))),
        ("username", json!(credential.username.as_deref().map(str::trim))),
        ("secret", json!(credential.secret)),
        ("url", json!(credential.url.as_deref().map(str::trim))),
        ("notes", json!(credential.notes.as_deref().map(canonical_text))),
    ])
}

fn photo_content_key(photo: &PhotoRecord) -> std::result::Result<Option<ContentKey>, String> {
    if let Some(hash) = photo.content_hash.as_deref() {
        return ContentKey::from_hex(hash)
            .map(Some)
            .ok_or_else(|| format!("invalid content hash {:?}", hash));
    }
    Ok(photo.content.as_ref().map(|bytes| ContentKey::from_bytes(bytes)))
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// Line endings and trailing whitespace differ between editors and exports
fn canonical_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Sub-second precision is not preserved by every remote
fn canonical_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
