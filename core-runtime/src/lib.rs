//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the record sync core:
//! - Logging and tracing infrastructure
//! - Configuration management (engine tuning and per-kind policies)
//! - Event bus for run lifecycle notifications
//!
//! ## Overview
//!
//! Other crates depend on this one for the conventions they share: how the
//! engine is configured, how it logs, and how callers (API layer, scheduler,
//! tray notifications) learn about reconciliation runs.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
