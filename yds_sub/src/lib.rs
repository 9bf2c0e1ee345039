//! YDS subscription and event dispatch layer.
//!
//! Subscription topics are mediated through per-topic memory-mapped slots
//! with request-id/event fields guarded by process-shared locks. Change
//! events run a priority-banded multi-phase protocol (update, change,
//! done/abort); operational and RPC events are request/reply; notification
//! events fan out with optional replay from per-module log files. Each
//! subscription context owns an event pipe drained by its listener worker.
//!
//! # Module Structure
//!
//! - [`slot`] - Slot files, event codes, fan-in counters
//! - [`evpipe`] - Event pipes (FIFOs) waking listener contexts
//! - [`dispatch`] - Originator-side event protocols
//! - [`listen`] - The per-context listener worker
//! - [`notif_log`] - Rolling notification logs and replay
//! - [`recovery`] - Dead-connection recovery sweep

#![warn(clippy::all)]

pub mod dispatch;
pub mod evpipe;
pub mod listen;
pub mod notif_log;
pub mod recovery;
pub mod slot;

pub use dispatch::CbError;
pub use listen::{ChangeEvent, NotifType, SubscrInner, SubscrState};
pub use slot::{EventCode, SubSlot};
