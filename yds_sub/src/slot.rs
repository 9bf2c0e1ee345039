//! Subscription slot files.
//!
//! A slot is a small per-topic file mapped into every interested process.
//! It carries a process-shared lock, the request id, the current event
//! code, the originator identity and a length-prefixed binary payload.
//! Multi-subscriber slots add the priority band and the fan-in counter.

use static_assertions::const_assert;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use yds_common::{LockMode, Sid, YdsResult};
use yds_shm::segment::Shm;
use yds_shm::sync::{self, ShmRwLock};

/// Slot event codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    /// Slot idle.
    None = 0,
    /// Processed successfully; reply payload may be present.
    Success = 1,
    /// A subscriber reported an error.
    Error = 2,
    /// Update phase of the change protocol.
    Update = 3,
    /// Change phase.
    Change = 4,
    /// Done phase.
    Done = 5,
    /// Abort phase.
    Abort = 6,
    /// Current data for a freshly enabled subscription.
    Enabled = 7,
    /// Operational data pull.
    Oper = 8,
    /// RPC/action invocation.
    Rpc = 9,
    /// Notification delivery.
    Notif = 10,
}

impl EventCode {
    /// Event processed by listeners (subscribers).
    pub fn is_listen(self) -> bool {
        matches!(
            self,
            EventCode::Update
                | EventCode::Change
                | EventCode::Done
                | EventCode::Abort
                | EventCode::Enabled
                | EventCode::Oper
                | EventCode::Rpc
                | EventCode::Notif
        )
    }

    /// Event processed by the originator.
    pub fn is_notify(self) -> bool {
        matches!(self, EventCode::Success | EventCode::Error)
    }

    /// Decode a raw event word; unknown values collapse to `None`.
    pub fn from_u32(v: u32) -> EventCode {
        match v {
            1 => EventCode::Success,
            2 => EventCode::Error,
            3 => EventCode::Update,
            4 => EventCode::Change,
            5 => EventCode::Done,
            6 => EventCode::Abort,
            7 => EventCode::Enabled,
            8 => EventCode::Oper,
            9 => EventCode::Rpc,
            10 => EventCode::Notif,
            _ => EventCode::None,
        }
    }
}

/// Single-subscriber slot header.
#[repr(C)]
pub struct SubShmHeader {
    /// Guards every field and the payload.
    pub lock: ShmRwLock,
    /// Monotonic request id; listeners track the last one they served.
    pub request_id: u32,
    /// Current [`EventCode`] as a raw word.
    pub event: u32,
    /// Originator identity.
    pub sid: Sid,
    /// Payload byte length.
    pub payload_len: u64,
}

/// Multi-subscriber slot header.
#[repr(C)]
pub struct MultiSubShmHeader {
    /// Common fields.
    pub base: SubShmHeader,
    /// Priority band this event addresses.
    pub priority: u32,
    /// Subscribers still to process the event; the last decrement flips
    /// the event for the originator.
    pub subscriber_count: AtomicU32,
}

const_assert!(size_of::<SubShmHeader>() % 8 == 0);
const_assert!(size_of::<MultiSubShmHeader>() % 8 == 0);

/// Stable 64-bit hash for slot file suffixes (FNV-1a).
pub fn path_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// One mapped subscription slot.
pub struct SubSlot {
    shm: Shm,
    multi: bool,
}

impl SubSlot {
    /// Open (creating and initializing if needed) a slot file.
    pub fn open(path: &Path, multi: bool) -> YdsResult<SubSlot> {
        let mut shm = Shm::open(path, true, None)?;
        let hsize = if multi {
            size_of::<MultiSubShmHeader>()
        } else {
            size_of::<SubShmHeader>()
        };
        if shm.size() < hsize {
            shm.remap(hsize)?;
            unsafe {
                std::ptr::write_bytes(shm.addr_mut(), 0, hsize);
                sync::rwlock_init(&raw mut (*shm.at::<SubShmHeader>(0)).lock, true)?;
            }
        }
        Ok(SubSlot { shm, multi })
    }

    /// Whether this is a multi-subscriber slot.
    pub fn is_multi(&self) -> bool {
        self.multi
    }

    fn header_size(&self) -> usize {
        if self.multi {
            size_of::<MultiSubShmHeader>()
        } else {
            size_of::<SubShmHeader>()
        }
    }

    fn base(&self) -> *mut SubShmHeader {
        unsafe { self.shm.at::<SubShmHeader>(0) }
    }

    fn multi_hdr(&self) -> *mut MultiSubShmHeader {
        debug_assert!(self.multi);
        unsafe { self.shm.at::<MultiSubShmHeader>(0) }
    }

    fn lock_ptr(&self) -> *mut ShmRwLock {
        unsafe { &raw mut (*self.base()).lock }
    }

    /// Remap if the file was grown by another process.
    pub fn refresh(&mut self) -> YdsResult<()> {
        if self.shm.file_size()? as usize != self.shm.size() {
            self.shm.remap(0)?;
        }
        Ok(())
    }

    /// Lock the slot, refreshing the mapping so the whole payload is
    /// addressable.
    pub fn lock(&mut self, mode: LockMode, timeout_ms: u32) -> YdsResult<()> {
        loop {
            self.refresh()?;
            unsafe {
                sync::rwlock_lock(self.lock_ptr(), timeout_ms, mode, "subscription slot")?;
            }
            let needed = self.header_size() + unsafe { (*self.base()).payload_len as usize };
            if needed <= self.shm.size() {
                return Ok(());
            }
            unsafe {
                sync::rwlock_unlock(self.lock_ptr(), mode);
            }
        }
    }

    /// Unlock the slot.
    pub fn unlock(&mut self, mode: LockMode) {
        unsafe {
            sync::rwlock_unlock(self.lock_ptr(), mode);
        }
    }

    /// Current request id. Slot must be locked.
    pub fn request_id(&self) -> u32 {
        unsafe { (*self.base()).request_id }
    }

    /// Current event. Slot must be locked.
    pub fn event(&self) -> EventCode {
        EventCode::from_u32(unsafe { (*self.base()).event })
    }

    /// Originator identity. Slot must be locked.
    pub fn sid(&self) -> Sid {
        unsafe { (*self.base()).sid }
    }

    /// Priority band of the current event (multi slots).
    pub fn priority(&self) -> u32 {
        unsafe { (*self.multi_hdr()).priority }
    }

    /// Remaining subscriber count (multi slots).
    pub fn subscriber_count(&self) -> u32 {
        unsafe { (*self.multi_hdr()).subscriber_count.load(Ordering::Acquire) }
    }

    /// Decrement the fan-in counter; payload writes before the decrement
    /// are visible to whoever observes the result. Returns the remaining
    /// count.
    pub fn dec_subscriber_count(&self) -> u32 {
        unsafe {
            (*self.multi_hdr())
                .subscriber_count
                .fetch_sub(1, Ordering::AcqRel)
                - 1
        }
    }

    /// Payload of the current event. Slot must be locked.
    pub fn payload(&self) -> &[u8] {
        let len = unsafe { (*self.base()).payload_len as usize };
        self.shm.bytes(self.header_size(), len)
    }

    fn ensure_capacity(&mut self, payload_len: usize) -> YdsResult<()> {
        let needed = self.header_size() + payload_len;
        if needed > self.shm.size() {
            self.shm.remap(needed)?;
        }
        Ok(())
    }

    fn write_fields(
        &mut self,
        request_id: u32,
        event: EventCode,
        sid: Sid,
        payload: &[u8],
    ) {
        let hsize = self.header_size();
        unsafe {
            let hdr = self.base();
            (*hdr).request_id = request_id;
            (*hdr).event = event as u32;
            (*hdr).sid = sid;
            (*hdr).payload_len = payload.len() as u64;
        }
        if !payload.is_empty() {
            self.shm.write_bytes(hsize, payload);
        }
    }

    /// Publish a new event into a locked multi slot.
    pub fn write_event_multi(
        &mut self,
        request_id: u32,
        priority: u32,
        subscriber_count: u32,
        event: EventCode,
        sid: Sid,
        payload: &[u8],
    ) -> YdsResult<()> {
        self.ensure_capacity(payload.len())?;
        self.write_fields(request_id, event, sid, payload);
        unsafe {
            let hdr = self.multi_hdr();
            (*hdr).priority = priority;
            (*hdr)
                .subscriber_count
                .store(subscriber_count, Ordering::Release);
        }
        Ok(())
    }

    /// Publish a new event into a locked single slot.
    pub fn write_event(
        &mut self,
        request_id: u32,
        event: EventCode,
        sid: Sid,
        payload: &[u8],
    ) -> YdsResult<()> {
        self.ensure_capacity(payload.len())?;
        self.write_fields(request_id, event, sid, payload);
        Ok(())
    }

    /// Write a reply event keeping the current request id and originator.
    pub fn write_reply(&mut self, event: EventCode, payload: &[u8]) -> YdsResult<()> {
        let (request_id, sid) = (self.request_id(), self.sid());
        self.ensure_capacity(payload.len())?;
        self.write_fields(request_id, event, sid, payload);
        Ok(())
    }

    /// Wait until `done(event, request_id)` holds or the timeout elapses.
    /// The slot must not be locked by this thread.
    pub fn wait<F: FnMut(EventCode, u32) -> bool>(
        &mut self,
        timeout_ms: u32,
        mut done: F,
    ) -> YdsResult<()> {
        self.refresh()?;
        let base = self.base();
        unsafe {
            sync::rwlock_wait_cond(
                self.lock_ptr(),
                timeout_ms,
                || done(EventCode::from_u32((*base).event), (*base).request_id),
                "subscription slot",
            )
        }
    }
}
