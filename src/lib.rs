//! Workspace facade crate.
//!
//! Re-exports the individual workspace crates so host applications (API
//! layer, scheduler, tray app) can depend on `recordsync-workspace` alone and
//! reach the adapter contract, runtime infrastructure, and reconciliation
//! engine through one path.

pub use bridge_traits;
pub use core_runtime;
pub use core_sync;
