//! Entity Adapter Contract
//!
//! Adapters sit at the I/O edge of the engine: the notes/reminders/photos/vault
//! automation on the local side, and the CalDAV server, markdown folder, photo
//! library or password vault on the remote side. Each one hands the core raw
//! records and accepts apply commands; all protocol and format specifics
//! (ICS fields, front-matter, AppleScript calls, vault API calls) stay behind
//! this trait.
//!
//! Raw records are a tagged union over [`EntityKind`]. Only the core's
//! normalization boundary looks inside them; everything else treats a
//! [`RawRecord`] as an opaque payload to hand back on apply.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::entity::EntityKind;
use crate::error::Result;

/// Adapter-private metadata (etags, internal object ids, revision counters).
///
/// Never part of a fingerprint.
pub type VolatileMetadata = BTreeMap<String, Value>;

/// A note as produced by a notes adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: VolatileMetadata,
}

/// A reminder as produced by a reminders / CalDAV adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub list: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    pub priority: Option<u8>,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: VolatileMetadata,
}

/// A photo asset as produced by a photo library adapter
///
/// Either `content` or a precomputed `content_hash` must be present; the path
/// and file name are informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: Option<String>,
    pub path: Option<String>,
    pub file_name: Option<String>,
    pub content: Option<Bytes>,
    pub content_hash: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub album: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: VolatileMetadata,
}

/// A credential entry as produced by a password vault adapter
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub username: Option<String>,
    pub secret: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub metadata: VolatileMetadata,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("url", &self.url)
            .field("modified_at", &self.modified_at)
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

/// Raw record handed over by an adapter, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    Note(NoteRecord),
    Reminder(ReminderRecord),
    Photo(PhotoRecord),
    Credential(CredentialRecord),
}

impl RawRecord {
    /// Kind of entity this record describes
    pub fn kind(&self) -> EntityKind {
        match self {
            RawRecord::Note(_) => EntityKind::Note,
            RawRecord::Reminder(_) => EntityKind::Reminder,
            RawRecord::Photo(_) => EntityKind::Photo,
            RawRecord::Credential(_) => EntityKind::Credential,
        }
    }

    /// Source-side identifier, if the adapter provided one
    pub fn source_id(&self) -> Option<&str> {
        match self {
            RawRecord::Note(r) => r.id.as_deref(),
            RawRecord::Reminder(r) => r.id.as_deref(),
            RawRecord::Photo(r) => r.id.as_deref(),
            RawRecord::Credential(r) => r.id.as_deref(),
        }
    }
}

/// What an adapter can do beyond the basic contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// The target accepts an explicit modification time on write
    pub settable_modified_at: bool,
}

/// Apply command sent to an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// Record copied from the other side
    pub payload: RawRecord,
    /// Modification time to stamp on the target, when the adapter supports it
    pub modified_at: Option<DateTime<Utc>>,
}

impl ApplyRequest {
    pub fn new(payload: RawRecord) -> Self {
        Self {
            payload,
            modified_at: None,
        }
    }

    pub fn with_modified_at(mut self, modified_at: Option<DateTime<Utc>>) -> Self {
        self.modified_at = modified_at;
        self
    }
}

/// Acknowledgement of a successful create or update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Identifier of the record on the target (the handle for later updates)
    pub id: String,
    /// Modification time the target stamped, if it reports one
    pub modified_at: Option<DateTime<Utc>>,
    /// Target-specific revision (etag, sequence number)
    pub revision: Option<String>,
}

impl WriteReceipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            modified_at: None,
            revision: None,
        }
    }
}

/// Adapter for one side of a sync pair
///
/// Implementations must be idempotent for repeated creates of the same payload
/// where the target allows it: a crash between apply and mapping commit makes
/// the engine re-issue the command on the next run.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::adapter::{EntityAdapter, RawRecord};
/// use bridge_traits::EntityKind;
///
/// async fn count_notes(adapter: &dyn EntityAdapter) -> bridge_traits::error::Result<usize> {
///     Ok(adapter.fetch_snapshot(EntityKind::Note).await?.len())
/// }
/// ```
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    /// Short name used in logs and reports ("caldav", "markdown", "vault")
    fn name(&self) -> &str;

    /// Optional capabilities of the target
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// List every record of `kind`, including tombstoned ones the adapter knows of
    async fn fetch_snapshot(&self, kind: EntityKind) -> Result<Vec<RawRecord>>;

    /// Create a record from a payload copied from the other side
    async fn apply_create(&self, kind: EntityKind, request: &ApplyRequest) -> Result<WriteReceipt>;

    /// Overwrite the record identified by `id`
    async fn apply_update(
        &self,
        kind: EntityKind,
        id: &str,
        request: &ApplyRequest,
    ) -> Result<WriteReceipt>;

    /// Delete the record identified by `id`
    async fn apply_delete(&self, kind: EntityKind, id: &str) -> Result<()>;
}
