//! Module and RPC subscription registry mutators.
//!
//! All mutators require the main SHM content to be write-locked (or
//! read-upgr upgraded) by the caller; the adders may grow ext and so also
//! need the remap-write lock.

use crate::alloc::{self, shm_str_size};
use crate::layout::*;
use crate::main_shm::ShmMain;
use yds_common::{Cid, Datastore, YdsError, YdsResult};

/// A change subscription with its resolved path filter.
#[derive(Debug, Clone)]
pub struct ChangeSub {
    /// Raw record.
    pub rec: ChangeSubShm,
    /// Path filter, empty for whole-module subscriptions.
    pub xpath: String,
}

/// An operational subscription with its resolved path.
#[derive(Debug, Clone)]
pub struct OperSub {
    /// Raw record.
    pub rec: OperSubShm,
    /// Provided path.
    pub xpath: String,
}

/// An RPC subscription with its resolved path.
#[derive(Debug, Clone)]
pub struct RpcSub {
    /// Raw record.
    pub rec: RpcSubShm,
    /// Subscription path.
    pub xpath: String,
}

/// Change subscriptions of one module and datastore.
pub fn change_subs(shm: &ShmMain, mod_idx: usize, ds: Datastore) -> Vec<ChangeSub> {
    let arr = shm.module(mod_idx).change_subs[ds as usize];
    unsafe {
        shm.ext
            .slice_at::<ChangeSubShm>(arr.subs as usize, arr.sub_count as usize)
    }
    .iter()
    .map(|rec| ChangeSub {
        rec: *rec,
        xpath: shm.ext.str_at(rec.xpath as usize).to_string(),
    })
    .collect()
}

/// Operational subscriptions of one module.
pub fn oper_subs(shm: &ShmMain, mod_idx: usize) -> Vec<OperSub> {
    let m = shm.module(mod_idx);
    unsafe {
        shm.ext
            .slice_at::<OperSubShm>(m.oper_subs as usize, m.oper_sub_count as usize)
    }
    .iter()
    .map(|rec| OperSub {
        rec: *rec,
        xpath: shm.ext.str_at(rec.xpath as usize).to_string(),
    })
    .collect()
}

/// Notification subscriptions of one module.
pub fn notif_subs(shm: &ShmMain, mod_idx: usize) -> Vec<NotifSubShm> {
    let m = shm.module(mod_idx);
    unsafe {
        shm.ext
            .slice_at::<NotifSubShm>(m.notif_subs as usize, m.notif_sub_count as usize)
    }
    .to_vec()
}

/// Subscriptions of one RPC entry.
pub fn rpc_subs(shm: &ShmMain, rpc_idx: usize) -> Vec<RpcSub> {
    let hdr = shm.header();
    let rpcs =
        unsafe { shm.ext.slice_at::<RpcShm>(hdr.rpc_subs as usize, hdr.rpc_sub_count as usize) };
    let r = rpcs[rpc_idx];
    unsafe { shm.ext.slice_at::<RpcSubShm>(r.subs as usize, r.sub_count as usize) }
        .iter()
        .map(|rec| RpcSub {
            rec: *rec,
            xpath: shm.ext.str_at(rec.xpath as usize).to_string(),
        })
        .collect()
}

/// Operation path of one RPC entry.
pub fn rpc_op_path(shm: &ShmMain, rpc_idx: usize) -> String {
    let hdr = shm.header();
    let rpcs =
        unsafe { shm.ext.slice_at::<RpcShm>(hdr.rpc_subs as usize, hdr.rpc_sub_count as usize) };
    shm.ext.str_at(rpcs[rpc_idx].op_path as usize).to_string()
}

/// Add a module change subscription.
pub fn change_sub_add(
    shm: &mut ShmMain,
    mod_idx: usize,
    ds: Datastore,
    xpath: Option<&str>,
    priority: u32,
    opts: u32,
    evpipe_num: u32,
    cid: Cid,
) -> YdsResult<()> {
    let arr = shm.module(mod_idx).change_subs[ds as usize];
    let dyn_size = xpath.map(shm_str_size).unwrap_or(0);
    let r = alloc::realloc_add(
        &mut shm.ext,
        arr.subs as usize,
        arr.sub_count,
        size_of::<ChangeSubShm>(),
        None,
        dyn_size,
    )?;
    let xpath_off = match xpath {
        Some(x) => {
            let mut end = r.dyn_off;
            alloc::shm_str_cpy(&mut shm.ext, &mut end, x) as u64
        }
        None => 0,
    };
    unsafe {
        *shm.ext.at::<ChangeSubShm>(r.item_off) = ChangeSubShm {
            xpath: xpath_off,
            priority,
            opts,
            evpipe_num,
            cid,
        };
    }
    let m = shm.module_mut(mod_idx);
    m.change_subs[ds as usize].subs = r.array_off as u64;
    m.change_subs[ds as usize].sub_count = arr.sub_count + 1;
    Ok(())
}

/// Remove one matching change subscription. With `only_evpipe`, matches on
/// the event pipe alone. Returns `false` when nothing matched; sets
/// `last_removed` when the array became empty.
pub fn change_sub_del(
    shm: &mut ShmMain,
    mod_idx: usize,
    ds: Datastore,
    xpath: Option<&str>,
    priority: u32,
    evpipe_num: u32,
    only_evpipe: bool,
    last_removed: &mut bool,
) -> bool {
    *last_removed = false;
    let subs = change_subs(shm, mod_idx, ds);
    let found = subs.iter().position(|s| {
        if only_evpipe {
            s.rec.evpipe_num == evpipe_num
        } else {
            s.xpath.as_str() == xpath.unwrap_or("")
                && s.rec.priority == priority
                && s.rec.evpipe_num == evpipe_num
        }
    });
    let Some(idx) = found else {
        return false;
    };
    let arr = shm.module(mod_idx).change_subs[ds as usize];
    let dyn_freed = if subs[idx].xpath.is_empty() {
        0
    } else {
        shm_str_size(&subs[idx].xpath)
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        arr.subs as usize,
        arr.sub_count,
        size_of::<ChangeSubShm>(),
        idx as u16,
        dyn_freed,
    );
    let m = shm.module_mut(mod_idx);
    m.change_subs[ds as usize].subs = new_off as u64;
    m.change_subs[ds as usize].sub_count = arr.sub_count - 1;
    *last_removed = arr.sub_count == 1;
    true
}

/// Add a module operational subscription. At most one per path.
pub fn oper_sub_add(
    shm: &mut ShmMain,
    mod_idx: usize,
    xpath: &str,
    sub_type: u32,
    opts: u32,
    evpipe_num: u32,
    cid: Cid,
) -> YdsResult<()> {
    if oper_subs(shm, mod_idx).iter().any(|s| s.xpath == xpath) {
        return Err(YdsError::Exists {
            msg: format!("Operational subscription on \"{}\".", xpath),
        });
    }
    let (subs_off, count) = {
        let m = shm.module(mod_idx);
        (m.oper_subs as usize, m.oper_sub_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<OperSubShm>(),
        None,
        shm_str_size(xpath),
    )?;
    let mut end = r.dyn_off;
    let xpath_off = alloc::shm_str_cpy(&mut shm.ext, &mut end, xpath) as u64;
    unsafe {
        *shm.ext.at::<OperSubShm>(r.item_off) = OperSubShm {
            xpath: xpath_off,
            sub_type,
            opts,
            evpipe_num,
            cid,
        };
    }
    let m = shm.module_mut(mod_idx);
    m.oper_subs = r.array_off as u64;
    m.oper_sub_count = count + 1;
    Ok(())
}

/// Remove one matching operational subscription. Returns the removed path,
/// `None` when nothing matched.
pub fn oper_sub_del(
    shm: &mut ShmMain,
    mod_idx: usize,
    xpath: Option<&str>,
    evpipe_num: u32,
    only_evpipe: bool,
) -> Option<String> {
    let subs = oper_subs(shm, mod_idx);
    let found = subs.iter().position(|s| {
        if only_evpipe {
            s.rec.evpipe_num == evpipe_num
        } else {
            Some(s.xpath.as_str()) == xpath && s.rec.evpipe_num == evpipe_num
        }
    })?;
    let (subs_off, count) = {
        let m = shm.module(mod_idx);
        (m.oper_subs as usize, m.oper_sub_count)
    };
    let removed = subs[found].xpath.clone();
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<OperSubShm>(),
        found as u16,
        shm_str_size(&removed),
    );
    let m = shm.module_mut(mod_idx);
    m.oper_subs = new_off as u64;
    m.oper_sub_count = count - 1;
    Some(removed)
}

/// Add a module notification subscription.
pub fn notif_sub_add(
    shm: &mut ShmMain,
    mod_idx: usize,
    sub_id: u32,
    evpipe_num: u32,
    cid: Cid,
) -> YdsResult<()> {
    let (subs_off, count) = {
        let m = shm.module(mod_idx);
        (m.notif_subs as usize, m.notif_sub_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<NotifSubShm>(),
        None,
        0,
    )?;
    unsafe {
        *shm.ext.at::<NotifSubShm>(r.item_off) = NotifSubShm {
            sub_id,
            evpipe_num,
            suspended: 0,
            cid,
        };
    }
    let m = shm.module_mut(mod_idx);
    m.notif_subs = r.array_off as u64;
    m.notif_sub_count = count + 1;
    Ok(())
}

/// Remove one matching notification subscription (by id, or by evpipe when
/// `sub_id` is 0). Sets `last_removed` when the array became empty.
pub fn notif_sub_del(
    shm: &mut ShmMain,
    mod_idx: usize,
    sub_id: u32,
    evpipe_num: u32,
    last_removed: &mut bool,
) -> bool {
    *last_removed = false;
    let subs = notif_subs(shm, mod_idx);
    let found = subs.iter().position(|s| {
        if sub_id != 0 {
            s.sub_id == sub_id
        } else {
            s.evpipe_num == evpipe_num
        }
    });
    let Some(idx) = found else {
        return false;
    };
    let (subs_off, count) = {
        let m = shm.module(mod_idx);
        (m.notif_subs as usize, m.notif_sub_count)
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<NotifSubShm>(),
        idx as u16,
        0,
    );
    let m = shm.module_mut(mod_idx);
    m.notif_subs = new_off as u64;
    m.notif_sub_count = count - 1;
    *last_removed = count == 1;
    true
}

/// Flip the suspended flag of a notification subscription.
pub fn notif_sub_suspend(
    shm: &mut ShmMain,
    mod_idx: usize,
    sub_id: u32,
    suspend: bool,
) -> YdsResult<()> {
    let (subs_off, count) = {
        let m = shm.module(mod_idx);
        (m.notif_subs as usize, m.notif_sub_count)
    };
    for i in 0..count as usize {
        let rec =
            unsafe { shm.ext.at::<NotifSubShm>(subs_off + i * size_of::<NotifSubShm>()) };
        unsafe {
            if (*rec).sub_id == sub_id {
                if ((*rec).suspended != 0) == suspend {
                    return Err(YdsError::InvalArg {
                        msg: format!(
                            "Notification subscription {} already {}.",
                            sub_id,
                            if suspend { "suspended" } else { "resumed" }
                        ),
                    });
                }
                (*rec).suspended = suspend as u32;
                return Ok(());
            }
        }
    }
    Err(YdsError::NotFound {
        msg: format!("Notification subscription {}.", sub_id),
    })
}

/// Update replay support of one module, or all when `mod_name` is `None`.
pub fn replay_support_update(
    shm: &mut ShmMain,
    mod_name: Option<&str>,
    enable: bool,
) -> YdsResult<()> {
    let indices: Vec<usize> = match mod_name {
        Some(name) => vec![shm.find_module(name).ok_or_else(|| YdsError::NotFound {
            msg: format!("Module \"{}\".", name),
        })?],
        None => (0..shm.mod_count()).collect(),
    };
    for idx in indices {
        let m = shm.module_mut(idx);
        if enable {
            m.flags |= MOD_FLAG_REPLAY_SUPPORT;
        } else {
            m.flags &= !MOD_FLAG_REPLAY_SUPPORT;
        }
    }
    Ok(())
}

/// Find or create the RPC entry for `op_path`; returns its index.
pub fn rpc_add(shm: &mut ShmMain, op_path: &str) -> YdsResult<usize> {
    if let Some(idx) = shm.find_rpc(op_path) {
        return Ok(idx);
    }
    let (array_off, count) = {
        let hdr = shm.header();
        (hdr.rpc_subs as usize, hdr.rpc_sub_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        array_off,
        count,
        size_of::<RpcShm>(),
        None,
        shm_str_size(op_path),
    )?;
    let mut end = r.dyn_off;
    let path_off = alloc::shm_str_cpy(&mut shm.ext, &mut end, op_path) as u64;
    unsafe {
        *shm.ext.at::<RpcShm>(r.item_off) = RpcShm {
            op_path: path_off,
            subs: 0,
            sub_count: 0,
            _pad: [0; 6],
        };
    }
    let hdr = shm.header_mut();
    hdr.rpc_subs = r.array_off as u64;
    hdr.rpc_sub_count = count + 1;
    Ok(count as usize)
}

fn rpc_rec_off(shm: &ShmMain, rpc_idx: usize) -> usize {
    shm.header().rpc_subs as usize + rpc_idx * size_of::<RpcShm>()
}

/// Remove the RPC entry at `rpc_idx`; its subscription array must already
/// be empty.
pub fn rpc_del(shm: &mut ShmMain, rpc_idx: usize) -> YdsResult<()> {
    let (array_off, count, path) = {
        let hdr = shm.header();
        let rec = unsafe { &*shm.ext.at::<RpcShm>(rpc_rec_off(shm, rpc_idx)) };
        if rec.sub_count != 0 {
            return Err(YdsError::Internal {
                msg: "Removing an RPC entry with live subscriptions.".to_string(),
            });
        }
        (
            hdr.rpc_subs as usize,
            hdr.rpc_sub_count,
            shm.ext.str_at(rec.op_path as usize).to_string(),
        )
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        array_off,
        count,
        size_of::<RpcShm>(),
        rpc_idx as u16,
        shm_str_size(&path),
    );
    let hdr = shm.header_mut();
    hdr.rpc_subs = new_off as u64;
    hdr.rpc_sub_count = count - 1;
    Ok(())
}

/// Add an RPC subscription to the entry at `rpc_idx`.
pub fn rpc_sub_add(
    shm: &mut ShmMain,
    rpc_idx: usize,
    xpath: &str,
    priority: u32,
    opts: u32,
    evpipe_num: u32,
    cid: Cid,
) -> YdsResult<()> {
    let rec_off = rpc_rec_off(shm, rpc_idx);
    let (subs_off, count) = {
        let rec = unsafe { &*shm.ext.at::<RpcShm>(rec_off) };
        (rec.subs as usize, rec.sub_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<RpcSubShm>(),
        None,
        shm_str_size(xpath),
    )?;
    let mut end = r.dyn_off;
    let xpath_off = alloc::shm_str_cpy(&mut shm.ext, &mut end, xpath) as u64;
    unsafe {
        *shm.ext.at::<RpcSubShm>(r.item_off) = RpcSubShm {
            xpath: xpath_off,
            priority,
            opts,
            evpipe_num,
            cid,
        };
        let rec = shm.ext.at::<RpcShm>(rec_off);
        (*rec).subs = r.array_off as u64;
        (*rec).sub_count = count + 1;
    }
    Ok(())
}

/// Remove one matching RPC subscription. Sets `last_removed` when the
/// entry has no subscriptions left (the caller then drops the entry).
pub fn rpc_sub_del(
    shm: &mut ShmMain,
    rpc_idx: usize,
    xpath: Option<&str>,
    priority: u32,
    evpipe_num: u32,
    only_evpipe: bool,
    last_removed: &mut bool,
) -> bool {
    *last_removed = false;
    let subs = rpc_subs(shm, rpc_idx);
    let found = subs.iter().position(|s| {
        if only_evpipe {
            s.rec.evpipe_num == evpipe_num
        } else {
            Some(s.xpath.as_str()) == xpath
                && s.rec.priority == priority
                && s.rec.evpipe_num == evpipe_num
        }
    });
    let Some(idx) = found else {
        return false;
    };
    let rec_off = rpc_rec_off(shm, rpc_idx);
    let (subs_off, count) = {
        let rec = unsafe { &*shm.ext.at::<RpcShm>(rec_off) };
        (rec.subs as usize, rec.sub_count)
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        subs_off,
        count,
        size_of::<RpcSubShm>(),
        idx as u16,
        shm_str_size(&subs[idx].xpath),
    );
    unsafe {
        let rec = shm.ext.at::<RpcShm>(rec_off);
        (*rec).subs = new_off as u64;
        (*rec).sub_count = count - 1;
    }
    *last_removed = count == 1;
    true
}

/// Remove every subscription owned by `cid` across all modules, datastores
/// and RPC entries. Every `(entry, subscription)` pair is visited
/// independently. Returns the removed subscriptions' evpipe numbers.
pub fn subs_del_all_for_cid(shm: &mut ShmMain, cid: Cid) -> Vec<u32> {
    let mut evpipes = Vec::new();

    for mod_idx in 0..shm.mod_count() {
        for ds in Datastore::ALL {
            loop {
                let subs = change_subs(shm, mod_idx, ds);
                let Some(pos) = subs.iter().position(|s| s.rec.cid == cid) else {
                    break;
                };
                evpipes.push(subs[pos].rec.evpipe_num);
                let mut last = false;
                change_sub_del(
                    shm,
                    mod_idx,
                    ds,
                    Some(subs[pos].xpath.as_str()).filter(|x| !x.is_empty()),
                    subs[pos].rec.priority,
                    subs[pos].rec.evpipe_num,
                    false,
                    &mut last,
                );
            }
        }
        loop {
            let subs = oper_subs(shm, mod_idx);
            let Some(pos) = subs.iter().position(|s| s.rec.cid == cid) else {
                break;
            };
            evpipes.push(subs[pos].rec.evpipe_num);
            oper_sub_del(shm, mod_idx, Some(&subs[pos].xpath), subs[pos].rec.evpipe_num, false);
        }
        loop {
            let subs = notif_subs(shm, mod_idx);
            let Some(pos) = subs.iter().position(|s| s.cid == cid) else {
                break;
            };
            evpipes.push(subs[pos].evpipe_num);
            let mut last = false;
            notif_sub_del(shm, mod_idx, subs[pos].sub_id, subs[pos].evpipe_num, &mut last);
        }
    }

    let mut rpc_idx = 0;
    while rpc_idx < shm.header().rpc_sub_count as usize {
        let mut removed_entry = false;
        loop {
            let subs = rpc_subs(shm, rpc_idx);
            let Some(pos) = subs.iter().position(|s| s.rec.cid == cid) else {
                break;
            };
            evpipes.push(subs[pos].rec.evpipe_num);
            let mut last = false;
            rpc_sub_del(
                shm,
                rpc_idx,
                Some(subs[pos].xpath.as_str()),
                subs[pos].rec.priority,
                subs[pos].rec.evpipe_num,
                false,
                &mut last,
            );
            if last {
                let _ = rpc_del(shm, rpc_idx);
                removed_entry = true;
                break;
            }
        }
        if !removed_entry {
            rpc_idx += 1;
        }
    }

    evpipes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::main_shm::ModuleInit;
    use yds_common::Repository;

    fn setup() -> (tempfile::TempDir, ShmMain) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        let mut created = false;
        let mut shm = ShmMain::open(&repo, &mut created).unwrap();
        let init = |name: &str| ModuleInit {
            name: name.to_string(),
            revision: "2024-01-01".to_string(),
            features: vec![],
            replay_support: false,
            data_deps: vec![],
            inv_data_deps: vec![],
            op_deps: vec![],
        };
        shm.rebuild(&[init("m"), init("n")]).unwrap();
        (tmp, shm)
    }

    #[test]
    fn test_change_sub_add_del() {
        let (_tmp, mut shm) = setup();
        let m = shm.find_module("m").unwrap();
        change_sub_add(&mut shm, m, Datastore::Running, Some("/m:server"), 10, 0, 5, 1).unwrap();
        change_sub_add(&mut shm, m, Datastore::Running, None, 20, 0, 6, 1).unwrap();

        let subs = change_subs(&shm, m, Datastore::Running);
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].xpath, "/m:server");
        assert_eq!(subs[1].xpath, "");
        assert!(change_subs(&shm, m, Datastore::Startup).is_empty());

        let mut last = false;
        assert!(change_sub_del(
            &mut shm,
            m,
            Datastore::Running,
            Some("/m:server"),
            10,
            5,
            false,
            &mut last
        ));
        assert!(!last);
        assert!(change_sub_del(&mut shm, m, Datastore::Running, None, 20, 6, false, &mut last));
        assert!(last);
        assert!(!change_sub_del(&mut shm, m, Datastore::Running, None, 20, 6, false, &mut last));
    }

    #[test]
    fn test_oper_sub_unique_per_path() {
        let (_tmp, mut shm) = setup();
        let m = shm.find_module("m").unwrap();
        oper_sub_add(&mut shm, m, "/m:state", OPER_SUB_STATE, 0, 5, 1).unwrap();
        assert!(matches!(
            oper_sub_add(&mut shm, m, "/m:state", OPER_SUB_STATE, 0, 6, 1),
            Err(YdsError::Exists { .. })
        ));
        assert_eq!(
            oper_sub_del(&mut shm, m, Some("/m:state"), 5, false).as_deref(),
            Some("/m:state")
        );
        assert!(oper_sub_del(&mut shm, m, Some("/m:state"), 5, false).is_none());
    }

    #[test]
    fn test_notif_sub_suspend() {
        let (_tmp, mut shm) = setup();
        let m = shm.find_module("m").unwrap();
        notif_sub_add(&mut shm, m, 100, 5, 1).unwrap();
        notif_sub_suspend(&mut shm, m, 100, true).unwrap();
        assert_eq!(notif_subs(&shm, m)[0].suspended, 1);
        // Suspending twice is an error.
        assert!(notif_sub_suspend(&mut shm, m, 100, true).is_err());
        notif_sub_suspend(&mut shm, m, 100, false).unwrap();
    }

    #[test]
    fn test_rpc_subscriptions() {
        let (_tmp, mut shm) = setup();
        let rpc = rpc_add(&mut shm, "/m:reset").unwrap();
        assert_eq!(rpc_add(&mut shm, "/m:reset").unwrap(), rpc);
        rpc_sub_add(&mut shm, rpc, "/m:reset", 0, 0, 5, 1).unwrap();
        rpc_sub_add(&mut shm, rpc, "/m:reset", 10, 0, 6, 1).unwrap();

        assert_eq!(shm.find_rpc("/m:reset"), Some(rpc));
        assert_eq!(rpc_subs(&shm, rpc).len(), 2);
        assert_eq!(rpc_op_path(&shm, rpc), "/m:reset");

        let mut last = false;
        assert!(rpc_sub_del(&mut shm, rpc, Some("/m:reset"), 0, 5, false, &mut last));
        assert!(!last);
        assert!(rpc_sub_del(&mut shm, rpc, Some("/m:reset"), 10, 6, false, &mut last));
        assert!(last);
        rpc_del(&mut shm, rpc).unwrap();
        assert_eq!(shm.find_rpc("/m:reset"), None);
    }

    #[test]
    fn test_subs_del_all_for_cid() {
        let (_tmp, mut shm) = setup();
        let m = shm.find_module("m").unwrap();
        let n = shm.find_module("n").unwrap();
        change_sub_add(&mut shm, m, Datastore::Running, None, 0, 0, 5, 1).unwrap();
        change_sub_add(&mut shm, m, Datastore::Candidate, None, 0, 0, 5, 1).unwrap();
        change_sub_add(&mut shm, n, Datastore::Running, None, 0, 0, 9, 2).unwrap();
        oper_sub_add(&mut shm, m, "/m:state", OPER_SUB_STATE, 0, 5, 1).unwrap();
        notif_sub_add(&mut shm, n, 100, 5, 1).unwrap();
        let rpc = rpc_add(&mut shm, "/m:reset").unwrap();
        rpc_sub_add(&mut shm, rpc, "/m:reset", 0, 0, 5, 1).unwrap();

        let mut evpipes = subs_del_all_for_cid(&mut shm, 1);
        evpipes.sort();
        evpipes.dedup();
        assert_eq!(evpipes, vec![5]);

        // Only CID 2's subscription survives; the RPC entry is gone.
        assert!(change_subs(&shm, m, Datastore::Running).is_empty());
        assert_eq!(change_subs(&shm, n, Datastore::Running).len(), 1);
        assert!(oper_subs(&shm, m).is_empty());
        assert!(notif_subs(&shm, n).is_empty());
        assert_eq!(shm.find_rpc("/m:reset"), None);
    }

    #[test]
    fn test_replay_support_update() {
        let (_tmp, mut shm) = setup();
        replay_support_update(&mut shm, Some("m"), true).unwrap();
        let m = shm.find_module("m").unwrap();
        assert_ne!(shm.module(m).flags & MOD_FLAG_REPLAY_SUPPORT, 0);
        replay_support_update(&mut shm, None, false).unwrap();
        assert_eq!(shm.module(m).flags & MOD_FLAG_REPLAY_SUPPORT, 0);
    }
}
