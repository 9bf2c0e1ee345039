//! YDS shared-memory substrate.
//!
//! Two memory-mapped files coordinate every process linked against the
//! library: the fixed-layout *main* segment (header plus packed module
//! records with embedded process-shared locks) and the append-growing
//! *ext* segment (a heap of offset-addressed strings and arrays with
//! wasted-byte accounting and in-place defragmentation). On top of the
//! substrate live the connection registry with lockfile liveness probing
//! and the module/subscription registries.
//!
//! # Module Structure
//!
//! - [`segment`] - Mapped segment files, growth protocol
//! - [`alloc`] - Ext heap allocator and wasted accounting
//! - [`sync`] - Process-shared mutex/cond/rwlock with timed acquisition
//! - [`layout`] - `#[repr(C)]` layouts of both segments
//! - [`main_shm`] - Open/init, lookup, two-level locking, defragmentation
//! - [`conn`] - Connection records and liveness
//! - [`mod_sub`] - Subscription registry mutators
//! - [`manifest`] - Installed modules and scheduled changes

#![warn(clippy::all)]

pub mod alloc;
pub mod conn;
pub mod layout;
pub mod main_shm;
pub mod manifest;
pub mod mod_sub;
pub mod segment;
pub mod sync;

pub use layout::SHM_VERSION;
pub use main_shm::{ModuleInit, OpDepInit, ShmMain};
pub use manifest::{Manifest, ManifestModule, ScheduledChange};
pub use segment::Shm;
