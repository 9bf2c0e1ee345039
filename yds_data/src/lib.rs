//! Schema and data tree support for YDS.
//!
//! This crate is the boundary to the schema/data library the datastore
//! engine builds on: module schemas with typed nodes, data trees addressed
//! by simple paths, NETCONF-style edit application, forward/reverse diffs
//! and the binary codec used for the per-module data files.
//!
//! # Module Structure
//!
//! - [`schema`] - Module schemas, dependency extraction, validation
//! - [`path`] - Path parsing (`/module:container/list[key='v']/leaf`)
//! - [`tree`] - Data trees and forests
//! - [`edit`] - Edit trees with NETCONF operations
//! - [`diff`] - Change-describing trees with reverse values
//! - [`lyb`] - Binary encoding of trees and diffs
//! - [`files`] - Per-module datastore files

#![warn(clippy::all)]

pub mod diff;
pub mod edit;
pub mod files;
pub mod lyb;
pub mod path;
pub mod schema;
pub mod tree;

pub use diff::{DiffNode, DiffOp, DiffTree};
pub use edit::{Edit, EditNode, EditOp};
pub use path::{Path, PathSegment};
pub use schema::{NodeKind, SchemaModule, SchemaNode, ValueType};
pub use tree::{DataForest, DataNode};
