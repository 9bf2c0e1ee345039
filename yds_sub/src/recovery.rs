//! Dead-connection recovery.
//!
//! Any engine entry that takes a write or read-upgradeable main SHM lock
//! sweeps the connection array first: every record whose lockfile probe
//! shows the holder is gone has its datastore locks released, its
//! subscriptions removed (with in-flight events dismissed), its stored
//! operational contributions deleted and its event pipes unlinked. The
//! sweep is idempotent; concurrent processes observing the same corpse
//! race benignly on the removal.

use crate::dispatch::{
    change_slot_path, dismiss_multi, dismiss_single, oper_slot_path, rpc_slot_path,
};
use crate::evpipe;
use crate::slot::SubSlot;
use yds_common::{Datastore, Repository, YdsError, YdsResult};
use yds_data::files;
use yds_shm::conn::{conn_alive, conn_del, conn_evpipes, conn_list};
use yds_shm::mod_sub::{self, subs_del_all_for_cid};
use yds_shm::ShmMain;

/// Sweep the connection array for dead holders. Requires the main SHM
/// content write lock (or an upgraded read-upgr lock) and the remap-write
/// lock. Errors of individual cleanup steps are logged and swallowed so
/// one broken corpse cannot wedge every caller; lock timeouts propagate.
pub fn recovery_sweep(shm: &mut ShmMain, repo: &Repository) -> YdsResult<()> {
    let conns = conn_list(shm);
    for conn in conns {
        if conn_alive(repo, conn.cid) {
            continue;
        }
        tracing::info!("Connection {} is dead, recovering its state.", conn.cid);

        // Release datastore locks the connection still owned, and break
        // data write locks a dead holder left behind.
        for mod_idx in 0..shm.mod_count() {
            for ds in 0..yds_common::types::DS_COUNT {
                {
                    let lock_info = &mut shm.module_mut(mod_idx).data_lock_info[ds];
                    if lock_info.ds_locked != 0 && lock_info.ds_owner_cid == conn.cid {
                        lock_info.ds_locked = 0;
                        lock_info.ds_owner_sid = 0;
                        lock_info.ds_owner_cid = 0;
                        lock_info.ds_ts = 0;
                    }
                }
                let broke_write = {
                    let lock_info = &mut shm.module_mut(mod_idx).data_lock_info[ds];
                    if lock_info.write_owner_cid == conn.cid {
                        lock_info.write_owner_cid = 0;
                        true
                    } else {
                        false
                    }
                };
                if broke_write {
                    let lock_ptr = shm.module_lock_ptr(mod_idx, ds);
                    if let Err(e) = unsafe { yds_shm::sync::rwlock_init(lock_ptr, true) } {
                        tracing::warn!("Reinitializing a dead holder's lock failed: {}.", e);
                    }
                }
            }
        }

        // Dismiss any event currently addressed to its subscriptions so
        // originators do not block until their deadline.
        match dismiss_conn_events(shm, repo, conn.cid) {
            Ok(()) => {}
            // A stuck lock must stay visible to the caller.
            Err(e @ YdsError::TimeOut { .. }) => return Err(e),
            Err(e) => tracing::warn!("Dismissing events of connection {} failed: {}.", conn.cid, e),
        }

        // Drop the subscription records.
        subs_del_all_for_cid(shm, conn.cid);

        // Remove its stored operational data contributions.
        for mod_idx in 0..shm.mod_count() {
            let module = shm.module_name(mod_idx).to_string();
            match files::load_oper_diff(repo, &module) {
                Ok(mut diff) => {
                    if !diff.is_empty() {
                        diff.remove_by_origin(conn.cid);
                        if let Err(e) = files::store_oper_diff(repo, &module, &diff) {
                            tracing::warn!("Recovery of \"{}\" oper data failed: {}.", module, e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Recovery of \"{}\" oper data failed: {}.", module, e),
            }
        }

        // Unlink its event pipes and forget the record.
        for evpipe_num in conn_evpipes(shm, &conn) {
            evpipe::unlink(repo, evpipe_num);
        }
        if let Err(e) = conn_del(shm, conn.cid) {
            tracing::warn!("Removing connection {} record failed: {}.", conn.cid, e);
        }
        let _ = std::fs::remove_file(repo.conn_lock_path(conn.cid));
    }
    Ok(())
}

fn dismiss_conn_events(shm: &mut ShmMain, repo: &Repository, cid: u32) -> YdsResult<()> {
    for mod_idx in 0..shm.mod_count() {
        let module = shm.module_name(mod_idx).to_string();

        for ds in Datastore::ALL {
            let dead: Vec<_> = mod_sub::change_subs(shm, mod_idx, ds)
                .into_iter()
                .filter(|s| s.rec.cid == cid)
                .collect();
            for sub in dead {
                let mut slot = SubSlot::open(&change_slot_path(repo, &module, ds), true)?;
                slot_dismiss_if_band(&mut slot, sub.rec.priority)?;
            }
        }
        for sub in mod_sub::oper_subs(shm, mod_idx)
            .into_iter()
            .filter(|s| s.rec.cid == cid)
        {
            let mut slot = SubSlot::open(&oper_slot_path(repo, &module, &sub.xpath), false)?;
            dismiss_single(&mut slot)?;
        }
        if mod_sub::notif_subs(shm, mod_idx)
            .iter()
            .any(|s| s.cid == cid)
        {
            let mut slot = SubSlot::open(&crate::dispatch::notif_slot_path(repo, &module), true)?;
            dismiss_multi(&mut slot)?;
        }
    }

    for rpc_idx in 0..shm.header().rpc_sub_count as usize {
        let op_path = mod_sub::rpc_op_path(shm, rpc_idx);
        let module = op_path
            .trim_start_matches('/')
            .split(':')
            .next()
            .unwrap_or("")
            .to_string();
        let dead: Vec<_> = mod_sub::rpc_subs(shm, rpc_idx)
            .into_iter()
            .filter(|s| s.rec.cid == cid)
            .collect();
        for sub in dead {
            let mut slot = SubSlot::open(&rpc_slot_path(repo, &module, &op_path), true)?;
            slot_dismiss_if_band(&mut slot, sub.rec.priority)?;
        }
    }
    Ok(())
}

fn slot_dismiss_if_band(slot: &mut SubSlot, priority: u32) -> YdsResult<()> {
    slot.lock(yds_common::LockMode::Read, 1000)?;
    let in_band = slot.event().is_listen() && slot.priority() == priority;
    slot.unlock(yds_common::LockMode::Read);
    if in_band {
        dismiss_multi(slot)?;
    }
    Ok(())
}
