//! Identifiers, datastores and lock modes.

use serde::{Deserialize, Serialize};

/// Connection ID, unique within one repository. Allocated monotonically
/// from the main SHM header; never reused while the repository lives.
pub type Cid = u32;

/// Session originator identity stored in subscription slots so that
/// subscribers can attribute events.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sid {
    /// Session ID.
    pub id: u32,
    /// Secondary (protocol-level) session ID, 0 if none.
    pub nc_id: u32,
}

/// Datastore kind. Each module keeps an independent data file per kind.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Datastore {
    /// Persistent configuration applied at startup.
    Startup = 0,
    /// Currently applied configuration.
    Running = 1,
    /// Scratch configuration, committed into running.
    Candidate = 2,
    /// Running enriched with state data and stored operational edits.
    Operational = 3,
}

/// Number of datastore kinds; sizes per-datastore arrays in SHM.
pub const DS_COUNT: usize = 4;

impl Datastore {
    /// All datastores, indexable by their numeric value.
    pub const ALL: [Datastore; DS_COUNT] = [
        Datastore::Startup,
        Datastore::Running,
        Datastore::Candidate,
        Datastore::Operational,
    ];

    /// Whether this is a conventional (configuration-only) datastore.
    pub fn is_conventional(self) -> bool {
        !matches!(self, Datastore::Operational)
    }

    /// File suffix used for the per-module data file.
    pub fn file_suffix(self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
            Datastore::Candidate => "candidate",
            Datastore::Operational => "operational",
        }
    }

    /// Datastore from its stable numeric value.
    pub fn from_index(idx: usize) -> Option<Datastore> {
        Self::ALL.get(idx).copied()
    }
}

/// Shared lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Not locked.
    None,
    /// Shared reader.
    Read,
    /// Shared reader that may later upgrade to writer. At most one per lock.
    ReadUpgr,
    /// Exclusive writer.
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_indices() {
        for (i, ds) in Datastore::ALL.iter().enumerate() {
            assert_eq!(*ds as usize, i);
            assert_eq!(Datastore::from_index(i), Some(*ds));
        }
        assert_eq!(Datastore::from_index(DS_COUNT), None);
    }

    #[test]
    fn test_conventional() {
        assert!(Datastore::Startup.is_conventional());
        assert!(Datastore::Running.is_conventional());
        assert!(Datastore::Candidate.is_conventional());
        assert!(!Datastore::Operational.is_conventional());
    }
}
