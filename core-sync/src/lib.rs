//! # Reconciliation Engine
//!
//! Keeps two copies of a user's personal records (notes, reminders, photos,
//! credentials) in sync across a local and a remote store.
//!
//! ## Overview
//!
//! Every run for one entity kind:
//! - Normalizes both snapshots into canonical entities with content fingerprints
//! - Classifies each pair against the persisted mapping journal
//! - Resolves conflicts by timestamp, baseline divergence, then policy
//! - Applies create/update/delete commands through the adapters, concurrently
//!   and with bounded retry
//! - Commits a mapping only after the adapter confirmed the write
//! - Produces a [`RunReport`] itemizing every action and failure
//!
//! ## Components
//!
//! - **Normalizer** (`normalizer`): raw adapter records to canonical entities
//! - **Mappings** (`mapping`, `store`): durable local/remote id pairing with
//!   per-kind single-flight partitions
//! - **Dedup** (`dedup`): content keys that survive renames and relocation
//! - **Classifier** (`classifier`): nine-way change classification
//! - **Resolver** (`resolver`): deterministic conflict winner selection
//! - **Apply** (`apply`): per-call timeouts and retry with backoff
//! - **Driver** (`driver`): one reconciliation pass for one kind
//! - **Coordinator** (`coordinator`): adapter registry, events, run history

pub mod apply;
pub mod classifier;
pub mod coordinator;
pub mod db;
pub mod dedup;
pub mod driver;
pub mod entity;
pub mod error;
pub mod mapping;
pub mod normalizer;
pub mod report;
pub mod repository;
pub mod resolver;
pub mod store;

pub use apply::{ApplyFailure, RetryPolicy};
pub use classifier::{ChangeClassifier, ChangeState, Classification, ClassifiedPair, ReviewItem};
pub use coordinator::SyncCoordinator;
pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use dedup::{AssetSource, ContentKey, DedupIndex};
pub use driver::{ReconciliationDriver, RunOptions, Snapshots, SyncTarget};
pub use entity::{Fingerprint, NormalizedEntity, Side};
pub use error::{Result, SyncError};
pub use mapping::{MappingId, MappingIndex, MappingRecord};
pub use normalizer::{normalize, normalize_snapshot};
pub use report::{
    ActionKind, ActionStatus, ClassificationCounts, EntityError, EntityErrorKind, PlannedAction,
    RunReport,
};
pub use repository::{RunReportRepository, SqliteRunReportRepository};
pub use resolver::{ConflictResolver, Resolution, ResolutionReason, WriteStamp};
pub use store::{MappingPartition, MappingPartitions, MappingStore, SqliteMappingStore};
