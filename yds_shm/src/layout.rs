//! Fixed layouts of the main and ext SHM segments.
//!
//! Main SHM starts with [`MainShmHeader`] followed by `mod_count` packed
//! [`ModShm`] records. Every `u64` offset field in these structures points
//! into the ext segment. The ext segment starts with [`ExtShmHeader`]
//! (the wasted-byte counter) followed by a heap of 8-byte-aligned strings
//! and arrays.

use crate::sync::ShmRwLock;
use static_assertions::const_assert;
use std::sync::atomic::AtomicU32;
use yds_common::types::DS_COUNT;

/// ABI version of the main and ext SHM content. Bumped on every layout
/// change; a mismatch aborts `connect`.
pub const SHM_VERSION: u32 = 1;

/// Module flag: notifications are logged for replay.
pub const MOD_FLAG_REPLAY_SUPPORT: u32 = 0x01;

/// Dependency kind: static module reference (leafref).
pub const DEP_REF: u32 = 0;
/// Dependency kind: instance-identifier.
pub const DEP_INSTID: u32 = 1;

/// Ext SHM header.
#[repr(C)]
pub struct ExtShmHeader {
    /// Unused allocated bytes in the segment, consumed by defragmentation.
    pub wasted: u64,
}

/// Size of [`ExtShmHeader`]; the first heap offset.
pub const EXT_HEADER_SIZE: usize = size_of::<ExtShmHeader>();

/// Main SHM header.
#[repr(C)]
pub struct MainShmHeader {
    /// ABI version word; must equal [`SHM_VERSION`].
    pub shm_ver: u32,
    _pad0: u32,
    /// Lock guarding main and ext SHM content that can change
    /// (subscriptions, connections, replay support).
    pub lock: ShmRwLock,
    /// Lock guarding the installed-module manifest file.
    pub manifest_lock: ShmRwLock,
    /// Number of [`ModShm`] records following this header.
    pub mod_count: u32,
    /// Number of connection records.
    pub conn_count: u32,
    /// Ext offset of the [`ConnShm`] array.
    pub conns: u64,
    /// Ext offset of the [`RpcShm`] array.
    pub rpc_subs: u64,
    /// Number of RPC entries.
    pub rpc_sub_count: u16,
    _pad1: [u8; 6],
    /// Next connection ID.
    pub new_cid: AtomicU32,
    /// Next session ID.
    pub new_sid: AtomicU32,
    /// Next notification subscription ID.
    pub new_sub_id: AtomicU32,
    /// Next event pipe number.
    pub new_evpipe_num: AtomicU32,
}

/// Per-datastore module data lock record.
#[repr(C)]
pub struct ModLockShm {
    /// Process-shared lock for the module's instance data.
    pub lock: ShmRwLock,
    /// Whether the datastore is locked (protocol-level lock).
    pub ds_locked: u32,
    /// Session owning the datastore lock, or of the write/read-upgr data
    /// lock holder.
    pub ds_owner_sid: u32,
    /// Connection owning the datastore lock; reset by recovery.
    pub ds_owner_cid: u32,
    /// Connection currently write-holding `lock`; a dead holder makes the
    /// recovery sweep reinitialize the lock.
    pub write_owner_cid: u32,
    /// Timestamp of the datastore lock (seconds since the epoch).
    pub ds_ts: i64,
}

/// Change subscription array reference of one datastore.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SubArrayShm {
    /// Ext offset of the subscription array.
    pub subs: u64,
    /// Number of subscriptions.
    pub sub_count: u16,
    /// Explicit tail padding.
    pub _pad: [u8; 6],
}

/// One installed module in main SHM.
#[repr(C)]
pub struct ModShm {
    /// Data lock record per datastore.
    pub data_lock_info: [ModLockShm; DS_COUNT],
    /// Lock guarding the module's notification log for replay.
    pub replay_lock: ShmRwLock,
    /// Module data version, strictly increased on every commit. Non-zero.
    pub ver: u32,
    /// Module flags ([`MOD_FLAG_REPLAY_SUPPORT`]).
    pub flags: u32,
    /// Ext offset of the module name.
    pub name: u64,
    /// Module revision, `YYYY-MM-DD` plus NUL.
    pub rev: [u8; 11],
    _pad0: [u8; 5],
    /// Ext offset of the enabled-feature array (`u64` string offsets).
    pub features: u64,
    /// Ext offset of the [`DataDepShm`] array.
    pub data_deps: u64,
    /// Ext offset of the inverse-dependency array (`u64` name offsets).
    pub inv_data_deps: u64,
    /// Ext offset of the [`OpDepShm`] array.
    pub op_deps: u64,
    /// Enabled feature count.
    pub feat_count: u16,
    /// Data dependency count.
    pub data_dep_count: u16,
    /// Inverse data dependency count.
    pub inv_data_dep_count: u16,
    /// Operation dependency count.
    pub op_dep_count: u16,
    /// Change subscriptions per datastore.
    pub change_subs: [SubArrayShm; DS_COUNT],
    /// Ext offset of the [`OperSubShm`] array.
    pub oper_subs: u64,
    /// Ext offset of the [`NotifSubShm`] array.
    pub notif_subs: u64,
    /// Operational subscription count.
    pub oper_sub_count: u16,
    /// Notification subscription count.
    pub notif_sub_count: u16,
    _pad1: [u8; 4],
}

/// Ext SHM module data dependency.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DataDepShm {
    /// [`DEP_REF`] or [`DEP_INSTID`].
    pub dep_type: u32,
    /// Explicit padding.
    pub _pad: u32,
    /// Ext offset of the target module name; `0` for instance-identifiers.
    pub module: u64,
    /// Ext offset of the path of the node carrying the dependency.
    pub xpath: u64,
}

/// Ext SHM module operation dependency.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpDepShm {
    /// Ext offset of the operation path.
    pub xpath: u64,
    /// Ext offset of the input dependency array ([`DataDepShm`]).
    pub in_deps: u64,
    /// Ext offset of the output dependency array ([`DataDepShm`]).
    pub out_deps: u64,
    /// Input dependency count.
    pub in_dep_count: u16,
    /// Output dependency count.
    pub out_dep_count: u16,
    /// Explicit tail padding.
    pub _pad: u32,
}

/// Ext SHM change subscription.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChangeSubShm {
    /// Ext offset of the subscription path filter; `0` for whole module.
    pub xpath: u64,
    /// Subscription priority; higher is notified earlier.
    pub priority: u32,
    /// Subscription option bits.
    pub opts: u32,
    /// Event pipe number.
    pub evpipe_num: u32,
    /// Owning connection.
    pub cid: u32,
}

/// Operational subscription kind: providing state data.
pub const OPER_SUB_STATE: u32 = 1;
/// Operational subscription kind: providing configuration data.
pub const OPER_SUB_CONFIG: u32 = 2;
/// Operational subscription kind: providing both.
pub const OPER_SUB_MIXED: u32 = 3;

/// Ext SHM operational subscription.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OperSubShm {
    /// Ext offset of the provided path.
    pub xpath: u64,
    /// One of the `OPER_SUB_*` kinds.
    pub sub_type: u32,
    /// Subscription option bits.
    pub opts: u32,
    /// Event pipe number.
    pub evpipe_num: u32,
    /// Owning connection.
    pub cid: u32,
}

/// Ext SHM notification subscription.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NotifSubShm {
    /// Unique subscription ID.
    pub sub_id: u32,
    /// Event pipe number.
    pub evpipe_num: u32,
    /// Whether delivery is suspended.
    pub suspended: u32,
    /// Owning connection.
    pub cid: u32,
}

/// Ext SHM RPC/action entry grouping its subscriptions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RpcShm {
    /// Ext offset of the operation path.
    pub op_path: u64,
    /// Ext offset of the [`RpcSubShm`] array.
    pub subs: u64,
    /// Subscription count.
    pub sub_count: u16,
    /// Explicit tail padding.
    pub _pad: [u8; 6],
}

/// Ext SHM RPC/action subscription.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RpcSubShm {
    /// Ext offset of the full subscription path.
    pub xpath: u64,
    /// Subscription priority.
    pub priority: u32,
    /// Subscription option bits.
    pub opts: u32,
    /// Event pipe number.
    pub evpipe_num: u32,
    /// Owning connection.
    pub cid: u32,
}

/// Ext SHM connection record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ConnShm {
    /// Connection ID.
    pub cid: u32,
    /// Process ID, informational.
    pub pid: i32,
    /// Ext offset of the held event pipe number array (`u64` each).
    pub evpipes: u64,
    /// Event pipe count.
    pub evpipe_count: u16,
    /// Explicit tail padding.
    pub _pad: [u8; 6],
}

// Every SHM structure is 8-byte aligned and a multiple of 8 bytes so that
// packed arrays keep their members aligned.
const_assert!(size_of::<MainShmHeader>() % 8 == 0);
const_assert!(size_of::<ModShm>() % 8 == 0);
const_assert!(size_of::<ModLockShm>() % 8 == 0);
const_assert!(size_of::<DataDepShm>() % 8 == 0);
const_assert!(size_of::<OpDepShm>() % 8 == 0);
const_assert!(size_of::<ChangeSubShm>() % 8 == 0);
const_assert!(size_of::<OperSubShm>() % 8 == 0);
const_assert!(size_of::<NotifSubShm>() % 8 == 0);
const_assert!(size_of::<RpcShm>() % 8 == 0);
const_assert!(size_of::<RpcSubShm>() % 8 == 0);
const_assert!(size_of::<ConnShm>() % 8 == 0);
const_assert!(align_of::<MainShmHeader>() == 8);
const_assert!(align_of::<ModShm>() == 8);

impl MainShmHeader {
    /// Byte offset of the module record at `idx` inside main SHM.
    pub fn module_off(idx: usize) -> usize {
        size_of::<MainShmHeader>() + idx * size_of::<ModShm>()
    }

    /// Main SHM size for `mod_count` modules.
    pub fn shm_size(mod_count: usize) -> usize {
        Self::module_off(mod_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_offsets_are_aligned() {
        assert_eq!(MainShmHeader::module_off(0) % 8, 0);
        assert_eq!(MainShmHeader::module_off(1) % 8, 0);
        assert_eq!(
            MainShmHeader::module_off(1) - MainShmHeader::module_off(0),
            size_of::<ModShm>()
        );
    }

    #[test]
    fn test_ext_header_is_one_word() {
        assert_eq!(EXT_HEADER_SIZE, 8);
    }
}
