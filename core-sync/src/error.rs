use bridge_traits::EntityKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cannot normalize {kind} record {entity}: {message}")]
    Normalization {
        kind: EntityKind,
        entity: String,
        message: String,
    },

    #[error("Ambiguous {kind} pair (local {local_id:?}, remote {remote_id:?}): {reason}")]
    ClassificationAmbiguity {
        kind: EntityKind,
        local_id: Option<String>,
        remote_id: Option<String>,
        reason: String,
    },

    #[error("Apply failed for {entity} after {attempts} attempt(s): {message}")]
    Apply {
        entity: String,
        message: String,
        transient: bool,
        attempts: u32,
    },

    #[error("Mapping consistency violated for {kind}: {message}")]
    MappingConsistency { kind: EntityKind, message: String },

    #[error("Reconciliation already in progress for {kind}")]
    SyncInProgress { kind: EntityKind },

    #[error("No active reconciliation run for {kind}")]
    RunNotFound { kind: EntityKind },

    #[error("No adapters registered for {kind}")]
    AdapterNotRegistered { kind: EntityKind },

    #[error("Failed to fetch {side} snapshot: {message}")]
    Snapshot { side: String, message: String },

    #[error("Reconciliation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl SyncError {
    /// Errors that abort the whole run rather than a single entity
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::MappingConsistency { .. } | SyncError::Snapshot { .. }
        )
    }
}

impl From<core_runtime::Error> for SyncError {
    fn from(err: core_runtime::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
