//! Process-shared synchronization primitives living inside shared memory.
//!
//! All primitives are initialized with `PTHREAD_PROCESS_SHARED` attributes
//! and operated through raw pointers into a mapping. Addresses must be
//! properly aligned; misalignment is a hard error. Every acquisition is
//! timed against a wall-clock deadline.

use crate::segment::Shm;
use static_assertions::const_assert;
use yds_common::{LockMode, YdsError, YdsResult};

/// Default timeout for main SHM lock operations.
pub const MAIN_LOCK_TIMEOUT_MS: u32 = 1000;
/// Default timeout for module data locks.
pub const MOD_LOCK_TIMEOUT_MS: u32 = 5000;
/// Internal timeout used when releasing a read lock.
pub const RWLOCK_READ_TIMEOUT_MS: u32 = 100;

/// Process-shared mutex.
#[repr(C)]
pub struct ShmMutex {
    inner: libc::pthread_mutex_t,
}

/// Process-shared condition variable.
#[repr(C)]
pub struct ShmCond {
    inner: libc::pthread_cond_t,
}

/// Process-shared reader-writer lock: readers bump `readers` under the
/// mutex and release it; a writer waits on the condition while readers are
/// present and holds the mutex through its critical section. At most one
/// read-upgradeable holder exists at a time.
#[repr(C)]
pub struct ShmRwLock {
    mutex: ShmMutex,
    cond: ShmCond,
    readers: u32,
    upgr: u32,
}

const_assert!(align_of::<ShmMutex>() <= 8);
const_assert!(align_of::<ShmCond>() <= 8);
const_assert!(size_of::<ShmRwLock>() % 8 == 0);

/// Wall-clock deadline `timeout_ms` from now.
pub fn deadline(timeout_ms: u32) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let mut sec = now.tv_sec + (timeout_ms / 1000) as libc::time_t;
    let mut nsec = now.tv_nsec + ((timeout_ms % 1000) as libc::c_long) * 1_000_000;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

fn align_check<T>(ptr: *const T, what: &str) -> YdsResult<()> {
    if (ptr as usize) % align_of::<T>() != 0 {
        return Err(YdsError::Internal {
            msg: format!("{} address not aligned.", what),
        });
    }
    Ok(())
}

fn errno_str(ret: libc::c_int) -> String {
    std::io::Error::from_raw_os_error(ret).to_string()
}

/// Initialize a mutex in shared memory.
///
/// # Safety
/// `m` must point into a live mapping with space for a [`ShmMutex`].
pub unsafe fn mutex_init(m: *mut ShmMutex, shared: bool) -> YdsResult<()> {
    align_check(m, "Mutex")?;
    unsafe {
        let mutex = &raw mut (*m).inner;
        if !shared {
            let ret = libc::pthread_mutex_init(mutex, std::ptr::null());
            if ret != 0 {
                return Err(YdsError::LockFailed {
                    msg: format!("Initializing mutex failed ({}).", errno_str(ret)),
                });
            }
            return Ok(());
        }
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        let ret = libc::pthread_mutexattr_init(&mut attr);
        if ret != 0 {
            return Err(YdsError::LockFailed {
                msg: format!("Initializing mutex attr failed ({}).", errno_str(ret)),
            });
        }
        let ret = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(YdsError::LockFailed {
                msg: format!("Changing mutex attr failed ({}).", errno_str(ret)),
            });
        }
        let ret = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if ret != 0 {
            return Err(YdsError::LockFailed {
                msg: format!("Initializing mutex failed ({}).", errno_str(ret)),
            });
        }
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
unsafe fn mutex_timedlock_raw(m: *mut libc::pthread_mutex_t, abs: &libc::timespec) -> libc::c_int {
    unsafe { libc::pthread_mutex_timedlock(m, abs) }
}

/// Timed-lock emulation for platforms without a native one: trylock with a
/// 5 ms sleep backoff against the wall-clock deadline, sleeping less when
/// the deadline is closer.
#[cfg(target_os = "macos")]
unsafe fn mutex_timedlock_raw(m: *mut libc::pthread_mutex_t, abs: &libc::timespec) -> libc::c_int {
    let mut ret;
    loop {
        ret = unsafe { libc::pthread_mutex_trylock(m) };
        if ret != libc::EBUSY {
            break;
        }

        let mut cur = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut cur);
        }
        let mut nsec_diff: i64 = 0;
        nsec_diff += ((abs.tv_sec as i64) - (cur.tv_sec as i64)) * 1_000_000_000;
        nsec_diff += (abs.tv_nsec as i64) - (cur.tv_nsec as i64);
        let diff_ms = if nsec_diff > 0 { nsec_diff / 1_000_000 } else { 0 };

        let dur = if diff_ms < 1 {
            ret = libc::ETIMEDOUT;
            break;
        } else if diff_ms < 5 {
            libc::timespec {
                tv_sec: 0,
                tv_nsec: (diff_ms * 1_000_000) as libc::c_long,
            }
        } else {
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 5_000_000,
            }
        };
        unsafe {
            libc::nanosleep(&dur, std::ptr::null_mut());
        }
    }
    ret
}

/// Lock a mutex, waiting at most `timeout_ms` (`-1` waits forever).
///
/// # Safety
/// `m` must point to an initialized [`ShmMutex`].
pub unsafe fn mutex_lock(m: *mut ShmMutex, timeout_ms: i32, what: &str) -> YdsResult<()> {
    debug_assert!(timeout_ms != 0);
    let ret = unsafe {
        let mutex = &raw mut (*m).inner;
        if timeout_ms == -1 {
            libc::pthread_mutex_lock(mutex)
        } else {
            let abs = deadline(timeout_ms as u32);
            mutex_timedlock_raw(mutex, &abs)
        }
    };
    match ret {
        0 => Ok(()),
        libc::ETIMEDOUT => Err(YdsError::TimeOut {
            msg: format!("{} mutex", what),
        }),
        _ => Err(YdsError::LockFailed {
            msg: format!("Locking {} mutex failed ({}).", what, errno_str(ret)),
        }),
    }
}

/// Unlock a mutex.
///
/// # Safety
/// `m` must point to a mutex locked by this thread.
pub unsafe fn mutex_unlock(m: *mut ShmMutex) {
    let ret = unsafe { libc::pthread_mutex_unlock(&raw mut (*m).inner) };
    if ret != 0 {
        tracing::warn!("Unlocking a mutex failed ({}).", errno_str(ret));
    }
}

/// Initialize a condition variable in shared memory.
///
/// # Safety
/// `c` must point into a live mapping with space for a [`ShmCond`].
pub unsafe fn cond_init(c: *mut ShmCond, shared: bool) -> YdsResult<()> {
    align_check(c, "Condition variable")?;
    unsafe {
        let cond = &raw mut (*c).inner;
        if !shared {
            let ret = libc::pthread_cond_init(cond, std::ptr::null());
            if ret != 0 {
                return Err(YdsError::LockFailed {
                    msg: format!("Initializing condition failed ({}).", errno_str(ret)),
                });
            }
            return Ok(());
        }
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        let ret = libc::pthread_condattr_init(&mut attr);
        if ret != 0 {
            return Err(YdsError::LockFailed {
                msg: format!("Initializing condition attr failed ({}).", errno_str(ret)),
            });
        }
        let ret = libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if ret != 0 {
            libc::pthread_condattr_destroy(&mut attr);
            return Err(YdsError::LockFailed {
                msg: format!("Changing condition attr failed ({}).", errno_str(ret)),
            });
        }
        let ret = libc::pthread_cond_init(cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if ret != 0 {
            return Err(YdsError::LockFailed {
                msg: format!("Initializing condition failed ({}).", errno_str(ret)),
            });
        }
    }
    Ok(())
}

/// Timed wait on a condition; returns the raw pthread result.
///
/// # Safety
/// `c` and `m` must be initialized and `m` locked by this thread.
pub unsafe fn cond_timedwait(c: *mut ShmCond, m: *mut ShmMutex, abs: &libc::timespec) -> libc::c_int {
    unsafe { libc::pthread_cond_timedwait(&raw mut (*c).inner, &raw mut (*m).inner, abs) }
}

/// Wake all condition waiters.
///
/// # Safety
/// `c` must point to an initialized [`ShmCond`].
pub unsafe fn cond_broadcast(c: *mut ShmCond) {
    unsafe {
        libc::pthread_cond_broadcast(&raw mut (*c).inner);
    }
}

/// Initialize a reader-writer lock in shared memory.
///
/// # Safety
/// `l` must point into a live mapping with space for a [`ShmRwLock`].
pub unsafe fn rwlock_init(l: *mut ShmRwLock, shared: bool) -> YdsResult<()> {
    unsafe {
        mutex_init(&raw mut (*l).mutex, shared)?;
        cond_init(&raw mut (*l).cond, shared)?;
        (*l).readers = 0;
        (*l).upgr = 0;
    }
    Ok(())
}

/// Acquire a reader-writer lock in `mode` within `timeout_ms`.
///
/// # Safety
/// `l` must point to an initialized [`ShmRwLock`].
pub unsafe fn rwlock_lock(
    l: *mut ShmRwLock,
    timeout_ms: u32,
    mode: LockMode,
    what: &str,
) -> YdsResult<()> {
    debug_assert!(mode != LockMode::None && timeout_ms > 0);
    let abs = deadline(timeout_ms);
    unsafe {
        let mutex = &raw mut (*l).mutex;
        let cond = &raw mut (*l).cond;

        let ret = mutex_timedlock_raw(&raw mut (*mutex).inner, &abs);
        if ret != 0 {
            return if ret == libc::ETIMEDOUT {
                Err(YdsError::TimeOut {
                    msg: format!("{} rwlock", what),
                })
            } else {
                Err(YdsError::LockFailed {
                    msg: format!("Locking {} rwlock failed ({}).", what, errno_str(ret)),
                })
            };
        }

        match mode {
            LockMode::Write => {
                let mut ret = 0;
                while ret == 0 && (*l).readers > 0 {
                    ret = cond_timedwait(cond, mutex, &abs);
                }
                if ret != 0 {
                    mutex_unlock(mutex);
                    return Err(YdsError::TimeOut {
                        msg: format!("{} rwlock write", what),
                    });
                }
                // The mutex stays held for the whole write critical section.
            }
            LockMode::ReadUpgr => {
                let mut ret = 0;
                while ret == 0 && (*l).upgr != 0 {
                    ret = cond_timedwait(cond, mutex, &abs);
                }
                if ret != 0 {
                    mutex_unlock(mutex);
                    return Err(YdsError::TimeOut {
                        msg: format!("{} rwlock read-upgr", what),
                    });
                }
                (*l).upgr = 1;
                (*l).readers += 1;
                mutex_unlock(mutex);
            }
            LockMode::Read => {
                (*l).readers += 1;
                mutex_unlock(mutex);
            }
            LockMode::None => unreachable!(),
        }
    }
    Ok(())
}

/// Release a reader-writer lock held in `mode`.
///
/// # Safety
/// `l` must be held by this thread in `mode`.
pub unsafe fn rwlock_unlock(l: *mut ShmRwLock, mode: LockMode) {
    unsafe {
        let mutex = &raw mut (*l).mutex;
        let cond = &raw mut (*l).cond;

        if mode == LockMode::Read || mode == LockMode::ReadUpgr {
            let abs = deadline(RWLOCK_READ_TIMEOUT_MS);
            let ret = mutex_timedlock_raw(&raw mut (*mutex).inner, &abs);
            if ret != 0 {
                tracing::warn!("Locking rwlock for read unlock failed ({}).", errno_str(ret));
            }
            if (*l).readers == 0 {
                tracing::warn!("Read-unlocking a rwlock with no readers.");
            } else {
                (*l).readers -= 1;
            }
            if mode == LockMode::ReadUpgr {
                (*l).upgr = 0;
            }
        } else {
            // Write unlock: the mutex is already held, no readers exist.
            debug_assert_eq!((*l).readers, 0);
            (*l).upgr = 0;
        }

        if (*l).readers == 0 {
            cond_broadcast(cond);
        }
        mutex_unlock(mutex);
    }
}

/// Upgrade a read-upgradeable hold to a write hold. Only the single
/// upgradeable reader may call this.
///
/// # Safety
/// `l` must be held by this thread in `ReadUpgr` mode.
pub unsafe fn rwlock_upgrade(l: *mut ShmRwLock, timeout_ms: u32, what: &str) -> YdsResult<()> {
    let abs = deadline(timeout_ms);
    unsafe {
        let mutex = &raw mut (*l).mutex;
        let cond = &raw mut (*l).cond;

        let ret = mutex_timedlock_raw(&raw mut (*mutex).inner, &abs);
        if ret != 0 {
            return Err(YdsError::TimeOut {
                msg: format!("{} rwlock upgrade", what),
            });
        }
        debug_assert!((*l).upgr == 1 && (*l).readers > 0);
        // Drop our own read hold while waiting for the others.
        (*l).readers -= 1;
        let mut ret = 0;
        while ret == 0 && (*l).readers > 0 {
            ret = cond_timedwait(cond, mutex, &abs);
        }
        if ret != 0 {
            // Restore the read hold; the lock state is unchanged.
            (*l).readers += 1;
            mutex_unlock(mutex);
            return Err(YdsError::TimeOut {
                msg: format!("{} rwlock upgrade", what),
            });
        }
        // Now a writer: mutex held, upgr still set to block other upgraders.
    }
    Ok(())
}

/// Downgrade an upgraded write hold back to read-upgradeable.
///
/// # Safety
/// `l` must be write-held by this thread via [`rwlock_upgrade`].
pub unsafe fn rwlock_downgrade(l: *mut ShmRwLock) {
    unsafe {
        (*l).readers += 1;
        cond_broadcast(&raw mut (*l).cond);
        mutex_unlock(&raw mut (*l).mutex);
    }
}

/// Initialize an [`ShmRwLock`] located at `off` inside a segment.
pub fn rwlock_init_at(shm: &mut Shm, off: usize, shared: bool) -> YdsResult<()> {
    unsafe { rwlock_init(shm.at::<ShmRwLock>(off), shared) }
}

/// Wait on the lock's condition until `done()` holds or the deadline
/// elapses. `done` runs with the lock's mutex held, so it may read fields
/// that writers only change under the full lock. Writers broadcast the
/// same condition on unlock.
///
/// # Safety
/// `l` must point to an initialized [`ShmRwLock`] not locked by this
/// thread.
pub unsafe fn rwlock_wait_cond<F: FnMut() -> bool>(
    l: *mut ShmRwLock,
    timeout_ms: u32,
    mut done: F,
    what: &str,
) -> YdsResult<()> {
    let abs = deadline(timeout_ms);
    unsafe {
        let mutex = &raw mut (*l).mutex;
        let cond = &raw mut (*l).cond;

        let ret = mutex_timedlock_raw(&raw mut (*mutex).inner, &abs);
        if ret != 0 {
            return Err(YdsError::TimeOut {
                msg: format!("{} wait", what),
            });
        }
        let mut ret = 0;
        while ret == 0 && !done() {
            ret = cond_timedwait(cond, mutex, &abs);
        }
        let timed_out = ret != 0 && !done();
        mutex_unlock(mutex);
        if timed_out {
            return Err(YdsError::TimeOut {
                msg: format!("{} wait", what),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlignedLock(Box<ShmRwLock>);
    unsafe impl Send for AlignedLock {}
    unsafe impl Sync for AlignedLock {}

    fn new_lock() -> Arc<AlignedLock> {
        let mut boxed: Box<ShmRwLock> = Box::new(unsafe { std::mem::zeroed() });
        unsafe {
            rwlock_init(&mut *boxed, false).unwrap();
        }
        Arc::new(AlignedLock(boxed))
    }

    fn ptr(l: &Arc<AlignedLock>) -> *mut ShmRwLock {
        &*l.0 as *const ShmRwLock as *mut ShmRwLock
    }

    #[test]
    fn test_read_write_exclusion() {
        let lock = new_lock();
        let counter = Arc::new(AtomicU32::new(0));

        unsafe {
            rwlock_lock(ptr(&lock), 1000, LockMode::Read, "test").unwrap();
        }

        let l2 = Arc::clone(&lock);
        let c2 = Arc::clone(&counter);
        let writer = std::thread::spawn(move || {
            unsafe {
                rwlock_lock(ptr(&l2), 5000, LockMode::Write, "test").unwrap();
            }
            c2.store(1, Ordering::SeqCst);
            unsafe {
                rwlock_unlock(ptr(&l2), LockMode::Write);
            }
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        unsafe {
            rwlock_unlock(ptr(&lock), LockMode::Read);
        }
        writer.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_lock_times_out_with_reader() {
        let lock = new_lock();
        unsafe {
            rwlock_lock(ptr(&lock), 1000, LockMode::Read, "test").unwrap();
            let err = rwlock_lock(ptr(&lock), 50, LockMode::Write, "test").unwrap_err();
            assert!(matches!(err, YdsError::TimeOut { .. }));
            rwlock_unlock(ptr(&lock), LockMode::Read);
            // Now it succeeds.
            rwlock_lock(ptr(&lock), 1000, LockMode::Write, "test").unwrap();
            rwlock_unlock(ptr(&lock), LockMode::Write);
        }
    }

    #[test]
    fn test_single_upgrader() {
        let lock = new_lock();
        unsafe {
            rwlock_lock(ptr(&lock), 1000, LockMode::ReadUpgr, "test").unwrap();
            // A second upgradeable reader must time out, a plain reader not.
            let err = rwlock_lock(ptr(&lock), 50, LockMode::ReadUpgr, "test").unwrap_err();
            assert!(matches!(err, YdsError::TimeOut { .. }));
            rwlock_lock(ptr(&lock), 1000, LockMode::Read, "test").unwrap();
            rwlock_unlock(ptr(&lock), LockMode::Read);
            rwlock_unlock(ptr(&lock), LockMode::ReadUpgr);
        }
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let lock = new_lock();
        unsafe {
            rwlock_lock(ptr(&lock), 1000, LockMode::ReadUpgr, "test").unwrap();
            rwlock_upgrade(ptr(&lock), 1000, "test").unwrap();
            // Write-held now; a reader cannot enter.
            let l2 = ptr(&lock);
            assert_eq!((*l2).readers, 0);
            rwlock_downgrade(ptr(&lock));
            assert_eq!((*l2).readers, 1);
            rwlock_unlock(ptr(&lock), LockMode::ReadUpgr);
            // Fully released.
            rwlock_lock(ptr(&lock), 1000, LockMode::Write, "test").unwrap();
            rwlock_unlock(ptr(&lock), LockMode::Write);
        }
    }

    #[test]
    fn test_deadline_is_in_the_future() {
        let a = deadline(100);
        let b = deadline(2100);
        assert!(b.tv_sec > a.tv_sec || (b.tv_sec == a.tv_sec && b.tv_nsec > a.tv_nsec));
    }
}
