//! YDS public surface: connections, sessions and subscription contexts.
//!
//! The library is linked into arbitrary client processes; there is no
//! broker. A [`Connection`] maps the repository's coordination segments, a
//! [`Session`] selects a datastore and carries pending edits, and a
//! [`Subscription`] context owns an event pipe whose listener worker
//! serves change, operational, RPC and notification subscriptions.
//!
//! ```no_run
//! use yds_api::{Connection, Session};
//! use yds_common::{ConnOptions, Datastore};
//!
//! # fn main() -> yds_common::YdsResult<()> {
//! let conn = Connection::connect(ConnOptions::empty())?;
//! let mut sess = Session::start(&conn, Datastore::Running);
//! sess.set_item("/my-module:server/port", Some("8080"))?;
//! sess.apply_changes(5000)?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod connection;
pub mod session;
pub mod subscription;

pub use connection::Connection;
pub use session::{DEFAULT_OPER_TIMEOUT_MS, Session};
pub use subscription::{OperSubType, Subscription};

pub use yds_common::{
    ConnOptions, Datastore, ErrorCode, GetOperOptions, Repository, SubOptions, YdsError,
    YdsResult, init_tracing,
};
pub use yds_data::edit::EditOp;
pub use yds_data::schema::{NodeKind, SchemaModule, SchemaNode, ValueType};
pub use yds_data::tree::{DataForest, DataNode};
pub use yds_sub::listen::NotifType;
pub use yds_sub::{CbError, EventCode};
