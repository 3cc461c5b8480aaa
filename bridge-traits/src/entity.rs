//! Shared entity vocabulary
//!
//! Kinds of personal records the engine keeps in sync and the per-kind sync
//! direction policy. Both the adapter contract and the runtime configuration
//! speak in these terms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of personal record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Free-form note (markdown folder, notes app)
    Note,
    /// Reminder / task (CalDAV VTODO)
    Reminder,
    /// Photo asset (photo library export)
    Photo,
    /// Credential entry (password vault)
    Credential,
}

impl EntityKind {
    /// All kinds, in a stable order
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Note,
        EntityKind::Reminder,
        EntityKind::Photo,
        EntityKind::Credential,
    ];

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Reminder => "reminder",
            EntityKind::Photo => "photo",
            EntityKind::Credential => "credential",
        }
    }

    /// Asset kinds are identified by content hash rather than path
    pub fn is_asset(&self) -> bool {
        matches!(self, EntityKind::Photo)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "note" => Ok(EntityKind::Note),
            "reminder" => Ok(EntityKind::Reminder),
            "photo" => Ok(EntityKind::Photo),
            "credential" => Ok(EntityKind::Credential),
            other => Err(format!("Unknown entity kind: {}", other)),
        }
    }
}

/// Which directions a kind (or a single pair) may propagate changes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Changes flow both ways
    #[default]
    Bidirectional,
    /// Local store is authoritative; nothing is pulled from the remote
    LocalAuthoritative,
    /// Remote store is authoritative; nothing is pushed from local
    RemoteAuthoritative,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Bidirectional => "bidirectional",
            SyncDirection::LocalAuthoritative => "local_authoritative",
            SyncDirection::RemoteAuthoritative => "remote_authoritative",
        }
    }

    /// Local changes may be written to the remote
    pub fn allows_push(&self) -> bool {
        !matches!(self, SyncDirection::RemoteAuthoritative)
    }

    /// Remote changes may be written to the local store
    pub fn allows_pull(&self) -> bool {
        !matches!(self, SyncDirection::LocalAuthoritative)
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            "local_authoritative" => Ok(SyncDirection::LocalAuthoritative),
            "remote_authoritative" => Ok(SyncDirection::RemoteAuthoritative),
            other => Err(format!("Unknown sync direction: {}", other)),
        }
    }
}
