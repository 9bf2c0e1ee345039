//! Main and ext SHM management: creation, lookup, the two-level lock
//! scheme and defragmentation.
//!
//! Every API entry that touches ext SHM goes through [`ShmMain::lock_remap`]:
//! the process-local remap lock protects the mapping from moving while in
//! use, the in-SHM rwlock protects the content. Growth takes remap-write
//! first, then the content lock.

use crate::alloc::{self, shm_size, shm_str_size};
use crate::layout::*;
use crate::segment::Shm;
use crate::sync::{self, MAIN_LOCK_TIMEOUT_MS, ShmRwLock};
use nix::fcntl::{Flock, FlockArg};
use parking_lot::RawRwLock;
use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockDowngrade};
use std::sync::atomic::Ordering;
use yds_common::{LockMode, Repository, YdsError, YdsResult};

/// Fraction of the ext segment that may be wasted before a remap-write
/// unlock defragments it.
const DEFRAG_THRESHOLD: f64 = 0.25;

/// Dependencies of one operation for [`ModuleInit`].
#[derive(Debug, Clone, Default)]
pub struct OpDepInit {
    /// Operation path.
    pub xpath: String,
    /// Input dependencies as `(kind, target module, xpath)`.
    pub in_deps: Vec<(u32, String, String)>,
    /// Output dependencies.
    pub out_deps: Vec<(u32, String, String)>,
}

/// Everything needed to materialize one module record during a rebuild.
#[derive(Debug, Clone)]
pub struct ModuleInit {
    /// Module name.
    pub name: String,
    /// Revision, `YYYY-MM-DD`.
    pub revision: String,
    /// Enabled features.
    pub features: Vec<String>,
    /// Whether notification replay is enabled.
    pub replay_support: bool,
    /// Data dependencies as `(kind, target module, xpath)`.
    pub data_deps: Vec<(u32, String, String)>,
    /// Names of modules depending on this one.
    pub inv_data_deps: Vec<String>,
    /// Operation dependencies.
    pub op_deps: Vec<OpDepInit>,
}

/// The pair of mapped coordination segments of one connection.
pub struct ShmMain {
    /// Main segment: header plus module records.
    pub main: Shm,
    /// Ext segment: wasted counter plus the blob heap.
    pub ext: Shm,
    remap_lock: RawRwLock,
}

impl ShmMain {
    /// Open both segments, initializing them when absent. Creation runs
    /// under an exclusive file lock so racing processes see either nothing
    /// or a fully initialized SHM. Sets `created` accordingly.
    pub fn open(repo: &Repository, created: &mut bool) -> YdsResult<ShmMain> {
        repo.ensure_dirs()?;

        let lock_path = repo.create_lock_path();
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| YdsError::from_io(lock_path.display().to_string(), e))?;
        let _create_lock = Flock::lock(lock_file, FlockArg::LockExclusive).map_err(|(_, e)| {
            YdsError::from_errno(lock_path.display().to_string(), e)
        })?;

        let mut main_created = false;
        let mut main = Shm::open(&repo.main_shm_path(), true, Some(&mut main_created))?;
        let mut ext = Shm::open(&repo.ext_shm_path(), true, None)?;

        if main_created || main.size() == 0 {
            main.remap(MainShmHeader::shm_size(0))?;
            unsafe {
                let hdr = main.at::<MainShmHeader>(0);
                std::ptr::write_bytes(hdr as *mut u8, 0, size_of::<MainShmHeader>());
                (*hdr).shm_ver = SHM_VERSION;
                sync::rwlock_init(&raw mut (*hdr).lock, true)?;
                sync::rwlock_init(&raw mut (*hdr).manifest_lock, true)?;
            }
            ext.remap(EXT_HEADER_SIZE)?;
            alloc::reset_wasted(&mut ext);
            *created = true;
            tracing::info!("Main SHM created (version {}).", SHM_VERSION);
        } else {
            *created = false;
        }

        let shm = ShmMain {
            main,
            ext,
            remap_lock: RawRwLock::INIT,
        };

        if shm.header().shm_ver != SHM_VERSION {
            return Err(YdsError::Internal {
                msg: format!(
                    "Main SHM version mismatch (lib {}, SHM {}).",
                    SHM_VERSION,
                    shm.header().shm_ver
                ),
            });
        }
        Ok(shm)
    }

    /// Main SHM header.
    pub fn header(&self) -> &MainShmHeader {
        unsafe { &*self.main.at::<MainShmHeader>(0) }
    }

    /// Main SHM header, mutable.
    pub fn header_mut(&mut self) -> &mut MainShmHeader {
        unsafe { &mut *self.main.at::<MainShmHeader>(0) }
    }

    fn main_lock_ptr(&self) -> *mut ShmRwLock {
        unsafe { &raw mut (*self.main.at::<MainShmHeader>(0)).lock }
    }

    /// Number of installed modules.
    pub fn mod_count(&self) -> usize {
        self.header().mod_count as usize
    }

    /// Module record by index.
    pub fn module(&self, idx: usize) -> &ModShm {
        assert!(idx < self.mod_count());
        unsafe { &*self.main.at::<ModShm>(MainShmHeader::module_off(idx)) }
    }

    /// Module record by index, mutable.
    pub fn module_mut(&mut self, idx: usize) -> &mut ModShm {
        assert!(idx < self.mod_count());
        unsafe { &mut *self.main.at::<ModShm>(MainShmHeader::module_off(idx)) }
    }

    /// Name of the module at `idx`.
    pub fn module_name(&self, idx: usize) -> &str {
        let off = self.module(idx).name as usize;
        self.ext.str_at(off)
    }

    /// Ext offset of the module record's name; used as the stable lock
    /// ordering key.
    pub fn module_order_key(&self, idx: usize) -> u64 {
        self.module(idx).name
    }

    /// Find a module by name.
    pub fn find_module(&self, name: &str) -> Option<usize> {
        (0..self.mod_count()).find(|i| self.module_name(*i) == name)
    }

    /// Raw pointer to a module's per-datastore data lock.
    pub fn module_lock_ptr(&self, idx: usize, ds: usize) -> *mut ShmRwLock {
        assert!(idx < self.mod_count());
        unsafe {
            &raw mut (*self.main.at::<ModShm>(MainShmHeader::module_off(idx))).data_lock_info[ds]
                .lock
        }
    }

    /// Raw pointer to a module's notification replay lock.
    pub fn module_replay_lock_ptr(&self, idx: usize) -> *mut ShmRwLock {
        assert!(idx < self.mod_count());
        unsafe { &raw mut (*self.main.at::<ModShm>(MainShmHeader::module_off(idx))).replay_lock }
    }

    /// Find an RPC entry by operation path.
    pub fn find_rpc(&self, op_path: &str) -> Option<usize> {
        let hdr = self.header();
        let rpcs =
            unsafe { self.ext.slice_at::<RpcShm>(hdr.rpc_subs as usize, hdr.rpc_sub_count as usize) };
        rpcs.iter()
            .position(|r| self.ext.str_at(r.op_path as usize) == op_path)
    }

    /// Allocate the next connection ID.
    pub fn new_cid(&self) -> u32 {
        self.header().new_cid.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocate the next session ID.
    pub fn new_sid(&self) -> u32 {
        self.header().new_sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocate the next notification subscription ID.
    pub fn new_sub_id(&self) -> u32 {
        self.header().new_sub_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocate the next event pipe number.
    pub fn new_evpipe_num(&self) -> u32 {
        self.header().new_evpipe_num.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Lock main/ext SHM and refresh the mapping if another process grew
    /// the ext file. `mode` locks the content, `remap` is `Read` to protect
    /// the mapping from moving or `Write` when the operation itself may
    /// grow or shrink ext.
    pub fn lock_remap(&mut self, mode: LockMode, remap: LockMode) -> YdsResult<()> {
        match remap {
            LockMode::Write => self.remap_lock.lock_exclusive(),
            _ => self.remap_lock.lock_shared(),
        }

        if let Err(e) = unsafe {
            sync::rwlock_lock(self.main_lock_ptr(), MAIN_LOCK_TIMEOUT_MS, mode, "main SHM")
        } {
            unsafe {
                match remap {
                    LockMode::Write => self.remap_lock.unlock_exclusive(),
                    _ => self.remap_lock.unlock_shared(),
                }
            }
            return Err(e);
        }

        // The ext file may have been grown by another process.
        let file_size = self.ext.file_size()? as usize;
        if file_size != self.ext.size() {
            if remap != LockMode::Write {
                // Upgrade the local mapping lock for the remap itself.
                unsafe {
                    self.remap_lock.unlock_shared();
                }
                self.remap_lock.lock_exclusive();
                let res = self.ext.remap(0);
                unsafe {
                    self.remap_lock.downgrade();
                }
                if let Err(e) = res {
                    self.unlock(mode, remap);
                    return Err(e);
                }
            } else if let Err(e) = self.ext.remap(0) {
                self.unlock(mode, remap);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unlock main/ext SHM. A remap-write unlock defragments ext when the
    /// wasted share exceeds the threshold, which requires the content to be
    /// write-locked.
    pub fn unlock(&mut self, mode: LockMode, remap: LockMode) {
        if remap == LockMode::Write && mode == LockMode::Write {
            let wasted = alloc::ext_wasted(&self.ext);
            let size = self.ext.size();
            if size > EXT_HEADER_SIZE && (wasted as f64) / (size as f64) > DEFRAG_THRESHOLD {
                if let Err(e) = self.defragment() {
                    tracing::warn!("Ext SHM defragmentation failed: {}.", e);
                } else {
                    tracing::debug!(
                        "Ext SHM defragmented ({} -> {} bytes).",
                        size,
                        self.ext.size()
                    );
                }
            }
        }

        unsafe {
            sync::rwlock_unlock(self.main_lock_ptr(), mode);
            match remap {
                LockMode::Write => self.remap_lock.unlock_exclusive(),
                _ => self.remap_lock.unlock_shared(),
            }
        }
    }

    /// Relock the content lock without touching the remap lock.
    pub fn relock(&mut self, mode: LockMode) -> YdsResult<()> {
        unsafe { sync::rwlock_lock(self.main_lock_ptr(), MAIN_LOCK_TIMEOUT_MS, mode, "main SHM") }
    }

    /// Upgrade a read-upgradeable content hold to write.
    pub fn upgrade(&mut self) -> YdsResult<()> {
        unsafe { sync::rwlock_upgrade(self.main_lock_ptr(), MAIN_LOCK_TIMEOUT_MS, "main SHM") }
    }

    /// Downgrade an upgraded write hold back to read-upgradeable.
    pub fn downgrade(&mut self) {
        unsafe { sync::rwlock_downgrade(self.main_lock_ptr()) }
    }

    /// Rebuild both segments from module definitions. Only valid while no
    /// other connection exists; id counters survive, subscriptions and
    /// connection records do not.
    pub fn rebuild(&mut self, defs: &[ModuleInit]) -> YdsResult<()> {
        let (new_cid, new_sid, new_sub_id, new_evpipe) = {
            let hdr = self.header();
            (
                hdr.new_cid.load(Ordering::Relaxed),
                hdr.new_sid.load(Ordering::Relaxed),
                hdr.new_sub_id.load(Ordering::Relaxed),
                hdr.new_evpipe_num.load(Ordering::Relaxed),
            )
        };

        // Lay out the new ext heap in a scratch buffer first.
        let mut buf = ExtBuilder::new();
        struct ModOffsets {
            name: u64,
            features: u64,
            data_deps: u64,
            inv_data_deps: u64,
            op_deps: u64,
        }
        let mut offsets = Vec::with_capacity(defs.len());
        for def in defs {
            let name = buf.push_str(&def.name);
            let feats: Vec<u64> = def.features.iter().map(|f| buf.push_str(f)).collect();
            let features = buf.push_u64s(&feats);
            let data_deps = buf.push_data_deps(&def.data_deps);
            let invs: Vec<u64> = def.inv_data_deps.iter().map(|m| buf.push_str(m)).collect();
            let inv_data_deps = buf.push_u64s(&invs);
            let op_items: Vec<OpDepShm> = def
                .op_deps
                .iter()
                .map(|op| {
                    let xpath = buf.push_str(&op.xpath);
                    let in_deps = buf.push_data_deps(&op.in_deps);
                    let out_deps = buf.push_data_deps(&op.out_deps);
                    OpDepShm {
                        xpath,
                        in_deps,
                        out_deps,
                        in_dep_count: op.in_deps.len() as u16,
                        out_dep_count: op.out_deps.len() as u16,
                        _pad: 0,
                    }
                })
                .collect();
            let op_deps = buf.push_items(&op_items);
            offsets.push(ModOffsets {
                name,
                features,
                data_deps,
                inv_data_deps,
                op_deps,
            });
        }

        // Resize main for the new module count and write the records. The
        // header locks stay untouched: the caller still holds the content
        // lock, and its state survives the remap inside the file pages.
        self.main.remap(MainShmHeader::shm_size(defs.len()))?;
        unsafe {
            let hdr = self.main.at::<MainShmHeader>(0);
            (*hdr).shm_ver = SHM_VERSION;
            (*hdr).mod_count = defs.len() as u32;
            (*hdr).conn_count = 0;
            (*hdr).conns = 0;
            (*hdr).rpc_subs = 0;
            (*hdr).rpc_sub_count = 0;
            (*hdr).new_cid.store(new_cid, Ordering::Relaxed);
            (*hdr).new_sid.store(new_sid, Ordering::Relaxed);
            (*hdr).new_sub_id.store(new_sub_id, Ordering::Relaxed);
            (*hdr).new_evpipe_num.store(new_evpipe, Ordering::Relaxed);
        }

        for (idx, (def, offs)) in defs.iter().zip(offsets.iter()).enumerate() {
            unsafe {
                let m = self.main.at::<ModShm>(MainShmHeader::module_off(idx));
                std::ptr::write_bytes(m as *mut u8, 0, size_of::<ModShm>());
                for ds in 0..yds_common::types::DS_COUNT {
                    sync::rwlock_init(&raw mut (*m).data_lock_info[ds].lock, true)?;
                }
                sync::rwlock_init(&raw mut (*m).replay_lock, true)?;
                (*m).ver = 1;
                (*m).flags = if def.replay_support {
                    MOD_FLAG_REPLAY_SUPPORT
                } else {
                    0
                };
                (*m).name = offs.name;
                let rev = def.revision.as_bytes();
                let n = rev.len().min(10);
                (&mut (*m).rev)[..n].copy_from_slice(&rev[..n]);
                (*m).rev[n] = 0;
                (*m).features = offs.features;
                (*m).feat_count = def.features.len() as u16;
                (*m).data_deps = offs.data_deps;
                (*m).data_dep_count = def.data_deps.len() as u16;
                (*m).inv_data_deps = offs.inv_data_deps;
                (*m).inv_data_dep_count = def.inv_data_deps.len() as u16;
                (*m).op_deps = offs.op_deps;
                (*m).op_dep_count = def.op_deps.len() as u16;
            }
        }

        let bytes = buf.finish();
        self.ext.remap(bytes.len())?;
        self.ext.write_bytes(0, &bytes);
        tracing::info!("Main SHM rebuilt with {} modules.", defs.len());
        Ok(())
    }

    /// Rebuild the ext heap in place, dropping every wasted byte and
    /// updating every live offset. Content must be write-locked and the
    /// remap lock write-held.
    pub fn defragment(&mut self) -> YdsResult<()> {
        let mut buf = ExtBuilder::new();

        // Connections with their evpipe arrays.
        let (conn_off, conn_count) = {
            let hdr = self.header();
            (hdr.conns as usize, hdr.conn_count as usize)
        };
        let conns: Vec<ConnShm> =
            unsafe { self.ext.slice_at::<ConnShm>(conn_off, conn_count) }.to_vec();
        let new_conns: Vec<ConnShm> = conns
            .iter()
            .map(|c| {
                let pipes: Vec<u64> = unsafe {
                    self.ext
                        .slice_at::<u64>(c.evpipes as usize, c.evpipe_count as usize)
                }
                .to_vec();
                let evpipes = buf.push_u64s(&pipes);
                ConnShm { evpipes, ..*c }
            })
            .collect();
        let new_conn_off = buf.push_items(&new_conns);

        // Modules.
        struct NewModOffs {
            name: u64,
            features: u64,
            data_deps: u64,
            inv_data_deps: u64,
            op_deps: u64,
            change_subs: [SubArrayShm; yds_common::types::DS_COUNT],
            oper_subs: u64,
            notif_subs: u64,
        }
        let mut new_offs = Vec::with_capacity(self.mod_count());
        for idx in 0..self.mod_count() {
            let m = self.module(idx);
            let name = buf.push_str(self.ext.str_at(m.name as usize));

            let feat_offs: Vec<u64> =
                unsafe { self.ext.slice_at::<u64>(m.features as usize, m.feat_count as usize) }
                    .to_vec();
            let feats: Vec<u64> = feat_offs
                .iter()
                .map(|off| buf.push_str(self.ext.str_at(*off as usize)))
                .collect();
            let features = buf.push_u64s(&feats);

            let data_deps = self.copy_dep_array(&mut buf, m.data_deps, m.data_dep_count);

            let inv_offs: Vec<u64> = unsafe {
                self.ext
                    .slice_at::<u64>(m.inv_data_deps as usize, m.inv_data_dep_count as usize)
            }
            .to_vec();
            let invs: Vec<u64> = inv_offs
                .iter()
                .map(|off| buf.push_str(self.ext.str_at(*off as usize)))
                .collect();
            let inv_data_deps = buf.push_u64s(&invs);

            let ops: Vec<OpDepShm> =
                unsafe { self.ext.slice_at::<OpDepShm>(m.op_deps as usize, m.op_dep_count as usize) }
                    .to_vec();
            let new_ops: Vec<OpDepShm> = ops
                .iter()
                .map(|op| {
                    let xpath = buf.push_str(self.ext.str_at(op.xpath as usize));
                    let in_deps = self.copy_dep_array(&mut buf, op.in_deps, op.in_dep_count);
                    let out_deps = self.copy_dep_array(&mut buf, op.out_deps, op.out_dep_count);
                    OpDepShm {
                        xpath,
                        in_deps,
                        out_deps,
                        ..*op
                    }
                })
                .collect();
            let op_deps = buf.push_items(&new_ops);

            let mut change_subs = [SubArrayShm {
                subs: 0,
                sub_count: 0,
                _pad: [0; 6],
            }; yds_common::types::DS_COUNT];
            for ds in 0..yds_common::types::DS_COUNT {
                let arr = &m.change_subs[ds];
                let subs: Vec<ChangeSubShm> = unsafe {
                    self.ext
                        .slice_at::<ChangeSubShm>(arr.subs as usize, arr.sub_count as usize)
                }
                .to_vec();
                let new_subs: Vec<ChangeSubShm> = subs
                    .iter()
                    .map(|s| ChangeSubShm {
                        xpath: if s.xpath == 0 {
                            0
                        } else {
                            buf.push_str(self.ext.str_at(s.xpath as usize))
                        },
                        ..*s
                    })
                    .collect();
                change_subs[ds] = SubArrayShm {
                    subs: buf.push_items(&new_subs),
                    sub_count: arr.sub_count,
                    _pad: [0; 6],
                };
            }

            let oper: Vec<OperSubShm> = unsafe {
                self.ext
                    .slice_at::<OperSubShm>(m.oper_subs as usize, m.oper_sub_count as usize)
            }
            .to_vec();
            let new_oper: Vec<OperSubShm> = oper
                .iter()
                .map(|s| OperSubShm {
                    xpath: buf.push_str(self.ext.str_at(s.xpath as usize)),
                    ..*s
                })
                .collect();
            let oper_subs = buf.push_items(&new_oper);

            let notif: Vec<NotifSubShm> = unsafe {
                self.ext
                    .slice_at::<NotifSubShm>(m.notif_subs as usize, m.notif_sub_count as usize)
            }
            .to_vec();
            let notif_subs = buf.push_items(&notif);

            new_offs.push(NewModOffs {
                name,
                features,
                data_deps,
                inv_data_deps,
                op_deps,
                change_subs,
                oper_subs,
                notif_subs,
            });
        }

        // RPC entries.
        let (rpc_off, rpc_count) = {
            let hdr = self.header();
            (hdr.rpc_subs as usize, hdr.rpc_sub_count as usize)
        };
        let rpcs: Vec<RpcShm> = unsafe { self.ext.slice_at::<RpcShm>(rpc_off, rpc_count) }.to_vec();
        let new_rpcs: Vec<RpcShm> = rpcs
            .iter()
            .map(|r| {
                let op_path = buf.push_str(self.ext.str_at(r.op_path as usize));
                let subs: Vec<RpcSubShm> =
                    unsafe { self.ext.slice_at::<RpcSubShm>(r.subs as usize, r.sub_count as usize) }
                        .to_vec();
                let new_subs: Vec<RpcSubShm> = subs
                    .iter()
                    .map(|s| RpcSubShm {
                        xpath: buf.push_str(self.ext.str_at(s.xpath as usize)),
                        ..*s
                    })
                    .collect();
                RpcShm {
                    op_path,
                    subs: buf.push_items(&new_subs),
                    ..*r
                }
            })
            .collect();
        let new_rpc_off = buf.push_items(&new_rpcs);

        // Swap the heap in and point every record at the fresh copies.
        let bytes = buf.finish();
        self.ext.remap(bytes.len())?;
        self.ext.write_bytes(0, &bytes);

        self.header_mut().conns = new_conn_off;
        self.header_mut().rpc_subs = new_rpc_off;
        for (idx, offs) in new_offs.into_iter().enumerate() {
            let m = self.module_mut(idx);
            m.name = offs.name;
            m.features = offs.features;
            m.data_deps = offs.data_deps;
            m.inv_data_deps = offs.inv_data_deps;
            m.op_deps = offs.op_deps;
            m.change_subs = offs.change_subs;
            m.oper_subs = offs.oper_subs;
            m.notif_subs = offs.notif_subs;
        }
        Ok(())
    }

    fn copy_dep_array(&self, buf: &mut ExtBuilder, off: u64, count: u16) -> u64 {
        let deps: Vec<DataDepShm> =
            unsafe { self.ext.slice_at::<DataDepShm>(off as usize, count as usize) }.to_vec();
        let new_deps: Vec<DataDepShm> = deps
            .iter()
            .map(|d| DataDepShm {
                module: if d.module == 0 {
                    0
                } else {
                    buf.push_str(self.ext.str_at(d.module as usize))
                },
                xpath: buf.push_str(self.ext.str_at(d.xpath as usize)),
                ..*d
            })
            .collect();
        buf.push_items(&new_deps)
    }
}

/// Scratch builder composing a fresh ext heap.
struct ExtBuilder {
    buf: Vec<u8>,
}

impl ExtBuilder {
    fn new() -> Self {
        // Header: wasted = 0.
        Self {
            buf: vec![0u8; EXT_HEADER_SIZE],
        }
    }

    fn push_str(&mut self, s: &str) -> u64 {
        let off = self.buf.len();
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.resize(off + shm_str_size(s), 0);
        off as u64
    }

    fn push_u64s(&mut self, items: &[u64]) -> u64 {
        if items.is_empty() {
            return 0;
        }
        let off = self.buf.len();
        for item in items {
            self.buf.extend_from_slice(&item.to_ne_bytes());
        }
        off as u64
    }

    fn push_items<T: Copy>(&mut self, items: &[T]) -> u64 {
        if items.is_empty() {
            return 0;
        }
        let off = self.buf.len();
        let bytes = unsafe {
            std::slice::from_raw_parts(items.as_ptr() as *const u8, size_of_val(items))
        };
        self.buf.extend_from_slice(bytes);
        self.buf.resize(off + shm_size(bytes.len()), 0);
        off as u64
    }

    fn push_data_deps(&mut self, deps: &[(u32, String, String)]) -> u64 {
        let items: Vec<DataDepShm> = deps
            .iter()
            .map(|(kind, module, xpath)| DataDepShm {
                dep_type: *kind,
                _pad: 0,
                module: if module.is_empty() {
                    0
                } else {
                    self.push_str(module)
                },
                xpath: self.push_str(xpath),
            })
            .collect();
        self.push_items(&items)
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}
