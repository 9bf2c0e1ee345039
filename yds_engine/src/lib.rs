//! YDS module-info transaction engine.
//!
//! Given a seed set of modules and an operation kind, the engine computes
//! the dependency closure, orders and acquires the module data locks,
//! loads data (from the process cache, the per-module files, or
//! operational providers), applies edits, validates, generates diffs,
//! drives the change event protocol, persists, and publishes the
//! config-change notification.
//!
//! # Module Structure
//!
//! - [`cache`] - Process-local running-data cache
//! - [`modinfo`] - Per-operation module set, closure, locking, loading
//! - [`store`] - Commit-side persistence
//! - [`engine`] - The phase pipeline driver

#![warn(clippy::all)]

pub mod cache;
pub mod engine;
pub mod modinfo;
pub mod store;

pub use cache::ModCache;
pub use engine::Engine;
pub use modinfo::{DepMode, ModInfo, ModRole};
