//! YDS Common Library
//!
//! Shared building blocks for the YDS workspace: the error taxonomy with
//! stable numeric codes, connection/session identifiers, datastore and lock
//! mode enums, option flag sets, and the repository directory layout.
//!
//! # Module Structure
//!
//! - [`error`] - Error codes and the workspace-wide error type
//! - [`types`] - CID/SID, datastores, lock modes
//! - [`options`] - Connection, subscription and operational-get flags
//! - [`repo`] - Repository root, file naming and environment overrides

#![warn(clippy::all)]

pub mod error;
pub mod options;
pub mod repo;
pub mod types;

pub use error::{ErrorCode, YdsError, YdsResult};
pub use options::{ConnOptions, GetOperOptions, SubOptions};
pub use repo::{Repository, SHM_PREFIX_ENV};
pub use types::{Cid, Datastore, LockMode, Sid};

/// Initialize tracing for the library.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
