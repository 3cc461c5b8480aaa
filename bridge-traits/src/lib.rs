//! # Host Bridge Traits
//!
//! The contract between the reconciliation core and everything around it.
//!
//! ## Overview
//!
//! The core never talks to a notes app, a CalDAV server, a photo library or a
//! password vault directly. Each of those is wrapped by an adapter that
//! implements [`EntityAdapter`](adapter::EntityAdapter): it produces raw
//! records for a snapshot and accepts create/update/delete commands.
//!
//! ## Traits
//!
//! - [`EntityAdapter`](adapter::EntityAdapter) - Snapshot + apply contract for one side of a pair
//! - [`Clock`](time::Clock) - Engine time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! Adapters report failures as [`BridgeError`](error::BridgeError). The variant
//! decides whether the engine retries the call:
//!
//! - `Transient`, `RateLimited`, `Timeout` - retried with bounded backoff
//! - `Permanent`, `NotFound`, `NotAvailable`, `Io` - reported against the entity
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync`: one run dispatches apply commands
//! for independent entities concurrently.

pub mod adapter;
pub mod entity;
pub mod error;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use adapter::{
    AdapterCapabilities, ApplyRequest, CredentialRecord, EntityAdapter, NoteRecord, PhotoRecord,
    RawRecord, ReminderRecord, VolatileMetadata, WriteReceipt,
};
pub use entity::{EntityKind, SyncDirection};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
