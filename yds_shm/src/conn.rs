//! Connection registry and liveness probing.
//!
//! Every live connection holds an advisory lock on its own lockfile for
//! its whole lifetime. Liveness of a peer is probed by try-locking its
//! file: a successful lock proves the holder is gone. No cooperative
//! heartbeat exists; a killed process drops its lock automatically.

use crate::alloc;
use crate::layout::ConnShm;
use crate::main_shm::ShmMain;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use yds_common::{Cid, Repository, YdsError, YdsResult};

/// Held lockfile of the local connection. Dropping it releases the lock
/// and removes the file.
pub struct ConnLockfile {
    lock: Option<Flock<File>>,
    path: PathBuf,
}

impl ConnLockfile {
    /// Create and lock the lockfile for `cid`.
    pub fn create(repo: &Repository, cid: Cid) -> YdsResult<ConnLockfile> {
        let path = repo.conn_lock_path(cid);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            YdsError::Internal {
                msg: format!(
                    "Connection {} lockfile already held ({}).",
                    cid,
                    errno.desc()
                ),
            }
        })?;
        Ok(ConnLockfile {
            lock: Some(lock),
            path,
        })
    }
}

impl Drop for ConnLockfile {
    fn drop(&mut self) {
        self.lock = None;
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Probe whether the connection `cid` is alive. A lockable (or missing)
/// lockfile proves the holder is dead; a held lock means alive; any other
/// failure is treated as alive to fail safe.
pub fn conn_alive(repo: &Repository, cid: Cid) -> bool {
    let path = repo.conn_lock_path(cid);
    let file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
        Err(_) => return true,
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            // Nobody held it; the connection is dead. Clean the file up.
            drop(lock);
            let _ = std::fs::remove_file(&path);
            false
        }
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => true,
        Err((_, nix::errno::Errno::EACCES)) => true,
        Err(_) => true,
    }
}

/// Snapshot of the connection array.
pub fn conn_list(shm: &ShmMain) -> Vec<ConnShm> {
    let hdr = shm.header();
    unsafe {
        shm.ext
            .slice_at::<ConnShm>(hdr.conns as usize, hdr.conn_count as usize)
    }
    .to_vec()
}

/// Event pipe numbers held by one connection record.
pub fn conn_evpipes(shm: &ShmMain, conn: &ConnShm) -> Vec<u32> {
    unsafe {
        shm.ext
            .slice_at::<u64>(conn.evpipes as usize, conn.evpipe_count as usize)
    }
    .iter()
    .map(|n| *n as u32)
    .collect()
}

/// Insert a connection record. Main SHM must be write-locked with the
/// remap lock write-held (the ext segment may grow).
pub fn conn_add(shm: &mut ShmMain, cid: Cid, pid: i32) -> YdsResult<()> {
    let (array_off, count) = {
        let hdr = shm.header();
        (hdr.conns as usize, hdr.conn_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        array_off,
        count as u16,
        size_of::<ConnShm>(),
        None,
        0,
    )?;
    unsafe {
        *shm.ext.at::<ConnShm>(r.item_off) = ConnShm {
            cid,
            pid,
            evpipes: 0,
            evpipe_count: 0,
            _pad: [0; 6],
        };
    }
    let hdr = shm.header_mut();
    hdr.conns = r.array_off as u64;
    hdr.conn_count = count + 1;
    tracing::debug!("Connection {} (pid {}) registered.", cid, pid);
    Ok(())
}

fn conn_index(shm: &ShmMain, cid: Cid) -> Option<usize> {
    conn_list(shm).iter().position(|c| c.cid == cid)
}

/// Remove a connection record, freeing its evpipe array.
pub fn conn_del(shm: &mut ShmMain, cid: Cid) -> YdsResult<()> {
    let Some(idx) = conn_index(shm, cid) else {
        return Err(YdsError::NotFound {
            msg: format!("Connection {} record.", cid),
        });
    };
    let (array_off, count, evpipe_bytes) = {
        let hdr = shm.header();
        let rec =
            unsafe { &*shm.ext.at::<ConnShm>(hdr.conns as usize + idx * size_of::<ConnShm>()) };
        (
            hdr.conns as usize,
            hdr.conn_count,
            alloc::shm_size(rec.evpipe_count as usize * size_of::<u64>()),
        )
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        array_off,
        count as u16,
        size_of::<ConnShm>(),
        idx as u16,
        evpipe_bytes,
    );
    let hdr = shm.header_mut();
    hdr.conns = new_off as u64;
    hdr.conn_count = count - 1;
    tracing::debug!("Connection {} record removed.", cid);
    Ok(())
}

/// Record an event pipe held by `cid`. May grow ext.
pub fn conn_evpipe_add(shm: &mut ShmMain, cid: Cid, evpipe_num: u32) -> YdsResult<()> {
    let Some(idx) = conn_index(shm, cid) else {
        return Err(YdsError::NotFound {
            msg: format!("Connection {} record.", cid),
        });
    };
    let conns_off = shm.header().conns as usize;
    let rec_off = conns_off + idx * size_of::<ConnShm>();
    let (pipes_off, pipe_count) = {
        let rec = unsafe { &*shm.ext.at::<ConnShm>(rec_off) };
        (rec.evpipes as usize, rec.evpipe_count)
    };
    let r = alloc::realloc_add(
        &mut shm.ext,
        pipes_off,
        pipe_count,
        size_of::<u64>(),
        None,
        0,
    )?;
    unsafe {
        *shm.ext.at::<u64>(r.item_off) = evpipe_num as u64;
        let rec = shm.ext.at::<ConnShm>(rec_off);
        (*rec).evpipes = r.array_off as u64;
        (*rec).evpipe_count = pipe_count + 1;
    }
    Ok(())
}

/// Forget an event pipe held by `cid`.
pub fn conn_evpipe_del(shm: &mut ShmMain, cid: Cid, evpipe_num: u32) -> YdsResult<()> {
    let Some(idx) = conn_index(shm, cid) else {
        return Err(YdsError::NotFound {
            msg: format!("Connection {} record.", cid),
        });
    };
    let conns_off = shm.header().conns as usize;
    let rec_off = conns_off + idx * size_of::<ConnShm>();
    let (pipes_off, pipe_count) = {
        let rec = unsafe { &*shm.ext.at::<ConnShm>(rec_off) };
        (rec.evpipes as usize, rec.evpipe_count)
    };
    let pipes = unsafe { shm.ext.slice_at::<u64>(pipes_off, pipe_count as usize) };
    let Some(pipe_idx) = pipes.iter().position(|p| *p == evpipe_num as u64) else {
        return Err(YdsError::NotFound {
            msg: format!("Event pipe {} of connection {}.", evpipe_num, cid),
        });
    };
    let new_off = alloc::realloc_del(
        &mut shm.ext,
        pipes_off,
        pipe_count,
        size_of::<u64>(),
        pipe_idx as u16,
        0,
    );
    unsafe {
        let rec = shm.ext.at::<ConnShm>(rec_off);
        (*rec).evpipes = new_off as u64;
        (*rec).evpipe_count = pipe_count - 1;
    }
    Ok(())
}

/// Number of live connections, probing each record.
pub fn live_conn_count(shm: &ShmMain, repo: &Repository) -> usize {
    conn_list(shm)
        .iter()
        .filter(|c| conn_alive(repo, c.cid))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Repository, ShmMain) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        let mut created = false;
        let shm = ShmMain::open(&repo, &mut created).unwrap();
        (tmp, repo, shm)
    }

    #[test]
    fn test_lockfile_liveness() {
        let (_tmp, repo, _shm) = setup();
        // No lockfile: dead.
        assert!(!conn_alive(&repo, 1));

        let held = ConnLockfile::create(&repo, 1).unwrap();
        assert!(conn_alive(&repo, 1));

        drop(held);
        assert!(!conn_alive(&repo, 1));
    }

    #[test]
    fn test_conn_add_del() {
        let (_tmp, _repo, mut shm) = setup();
        conn_add(&mut shm, 1, 100).unwrap();
        conn_add(&mut shm, 2, 200).unwrap();
        let list = conn_list(&shm);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].cid, 1);
        assert_eq!(list[1].pid, 200);

        conn_del(&mut shm, 1).unwrap();
        let list = conn_list(&shm);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].cid, 2);
        assert!(matches!(
            conn_del(&mut shm, 1),
            Err(YdsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_conn_evpipes() {
        let (_tmp, _repo, mut shm) = setup();
        conn_add(&mut shm, 7, 100).unwrap();
        conn_evpipe_add(&mut shm, 7, 11).unwrap();
        conn_evpipe_add(&mut shm, 7, 12).unwrap();

        let rec = conn_list(&shm)[0];
        assert_eq!(conn_evpipes(&shm, &rec), vec![11, 12]);

        conn_evpipe_del(&mut shm, 7, 11).unwrap();
        let rec = conn_list(&shm)[0];
        assert_eq!(conn_evpipes(&shm, &rec), vec![12]);
    }

    #[test]
    fn test_live_conn_count_ignores_dead() {
        let (_tmp, repo, mut shm) = setup();
        conn_add(&mut shm, 1, 100).unwrap();
        conn_add(&mut shm, 2, 200).unwrap();
        let held = ConnLockfile::create(&repo, 1).unwrap();
        // CID 2 never created its lockfile: counted dead.
        assert_eq!(live_conn_count(&shm, &repo), 1);
        drop(held);
        assert_eq!(live_conn_count(&shm, &repo), 0);
    }
}
