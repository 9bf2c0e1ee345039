//! Option flag sets for connections, subscriptions and operational reads.

use bitflags::bitflags;

bitflags! {
    /// Connection options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnOptions: u32 {
        /// Keep a process-local cache of running data, versioned against
        /// the module version counters.
        const CACHE_RUNNING = 0x01;
        /// Fail `connect` if applying scheduled module changes fails,
        /// instead of logging and continuing.
        const ERR_ON_SCHED_FAIL = 0x02;
    }
}

bitflags! {
    /// Subscription options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubOptions: u32 {
        /// Do not spawn the listener worker; the caller drives event
        /// processing explicitly.
        const NO_THREAD = 0x01;
        /// The subscriber only watches; it never blocks the change
        /// protocol and its replies are not waited for.
        const PASSIVE = 0x02;
        /// Deliver only the Done phase, skipping Change.
        const DONE_ONLY = 0x04;
        /// Deliver an Enabled event with current data right after
        /// subscribing.
        const ENABLED = 0x08;
        /// The subscriber participates in the Update phase and may return
        /// an amending edit.
        const UPDATE = 0x10;
        /// Merge provided operational data with data of other subscribers
        /// on the same path instead of replacing them.
        const OPER_MERGE = 0x20;
    }
}

bitflags! {
    /// Operational-datastore read options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GetOperOptions: u32 {
        /// Exclude state data.
        const NO_STATE = 0x01;
        /// Exclude configuration data.
        const NO_CONFIG = 0x02;
        /// Skip the stored operational edits.
        const NO_STORED = 0x04;
        /// Do not invoke operational providers.
        const NO_SUBS = 0x08;
        /// Annotate returned nodes with their origin.
        const WITH_ORIGIN = 0x10;
    }
}

/// Permission requirement of an engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermCheck {
    /// No check.
    None,
    /// Read access required; `strict` decides between error and drop.
    Read {
        /// Return `Unauthorized` instead of dropping inaccessible modules.
        strict: bool,
    },
    /// Write access required, always strict.
    Write,
}
