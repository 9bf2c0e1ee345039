//! The per-context listener: one worker per subscription context, waiting
//! on the context's event pipe and serving every subscription it owns.

use crate::dispatch::{
    CbError, ChangePayload, NotifPayload, OperPayload, OperReply, RpcPayload, RpcReply,
    UpdateReply, change_slot_path, notif_slot_path, oper_slot_path, rpc_slot_path,
};
use crate::evpipe;
use crate::notif_log::{self, now_ts};
use crate::slot::{EventCode, SubSlot};
use parking_lot::Mutex;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use yds_common::{Cid, Datastore, LockMode, Repository, SubOptions, YdsError, YdsResult};
use yds_data::diff::DiffTree;
use yds_data::edit::Edit;
use yds_data::lyb;
use yds_data::tree::DataNode;

/// Timeout for slot locks taken by the listener.
const SLOT_LOCK_TIMEOUT_MS: u32 = 1000;
/// Poll period; bounds stop-time detection latency.
const LOOP_POLL_MS: u16 = 500;

/// A change event handed to a subscriber callback.
pub struct ChangeEvent<'a> {
    /// Module the change belongs to.
    pub module: &'a str,
    /// Target datastore.
    pub ds: Datastore,
    /// Phase being delivered.
    pub event: EventCode,
    /// Forward diff of the module.
    pub diff: &'a DiffTree,
}

/// Kind of a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifType {
    /// Live notification.
    Realtime,
    /// Logged notification delivered during replay.
    Replay,
    /// All logged notifications were delivered.
    ReplayComplete,
    /// The subscription's stop time elapsed; it is being removed.
    Stop,
}

/// Change callback: may return an amending edit during the Update phase.
pub type ChangeCallback =
    Box<dyn FnMut(&ChangeEvent<'_>) -> Result<Option<Edit>, CbError> + Send>;
/// Operational provider callback.
pub type OperCallback =
    Box<dyn FnMut(&str, &str) -> Result<Vec<DataNode>, CbError> + Send>;
/// RPC/action callback: input tree in, output tree out.
pub type RpcCallback = Box<dyn FnMut(&DataNode) -> Result<DataNode, CbError> + Send>;
/// Notification callback.
pub type NotifCallback = Box<dyn FnMut(NotifType, u64, Option<&DataNode>) + Send>;

/// Local state of one change subscription.
pub struct ChangeSubState {
    /// Module name.
    pub module: String,
    /// Datastore.
    pub ds: Datastore,
    /// Optional path filter.
    pub xpath: Option<String>,
    /// Priority band.
    pub priority: u32,
    /// Options.
    pub opts: SubOptions,
    /// Last request id served.
    pub last_request_id: u32,
    /// Last event served.
    pub last_event: EventCode,
    /// User callback.
    pub cb: ChangeCallback,
}

/// Local state of one operational subscription.
pub struct OperSubState {
    /// Module name.
    pub module: String,
    /// Provided path.
    pub xpath: String,
    /// Last request id served.
    pub last_request_id: u32,
    /// User callback.
    pub cb: OperCallback,
}

/// Local state of one RPC subscription.
pub struct RpcSubState {
    /// Module owning the operation.
    pub module: String,
    /// Operation path.
    pub op_path: String,
    /// Priority band.
    pub priority: u32,
    /// Last request id served.
    pub last_request_id: u32,
    /// Last event served.
    pub last_event: EventCode,
    /// User callback.
    pub cb: RpcCallback,
}

/// Local state of one notification subscription.
pub struct NotifSubState {
    /// Module name.
    pub module: String,
    /// Unique subscription id.
    pub sub_id: u32,
    /// Deliver logged notifications from this time on.
    pub start_time: Option<u64>,
    /// Stop and remove the subscription at this time.
    pub stop_time: Option<u64>,
    /// Local suspension mirror of the registry flag.
    pub suspended: bool,
    /// Whether the replay already ran.
    pub replayed: bool,
    /// Last request id served.
    pub last_request_id: u32,
    /// User callback.
    pub cb: NotifCallback,
}

/// All subscriptions of one context.
#[derive(Default)]
pub struct SubscrState {
    /// Change subscriptions.
    pub change: Vec<ChangeSubState>,
    /// Operational subscriptions.
    pub oper: Vec<OperSubState>,
    /// RPC subscriptions.
    pub rpc: Vec<RpcSubState>,
    /// Notification subscriptions.
    pub notif: Vec<NotifSubState>,
}

/// Shared core of a subscription context, owned by the API handle and the
/// listener thread together.
pub struct SubscrInner {
    /// Repository the context belongs to.
    pub repo: Repository,
    /// Owning connection.
    pub cid: Cid,
    /// Event pipe number of this context.
    pub evpipe_num: u32,
    /// Subscription lists.
    pub state: Mutex<SubscrState>,
    /// Cooperative shutdown flag.
    pub stop: AtomicBool,
    /// Errors hit while serving events; the listener keeps going.
    pub errors: Mutex<Vec<YdsError>>,
    /// Called when a notification subscription finishes (stop time), so
    /// the registry record can be dropped.
    pub notif_finisher: Box<dyn Fn(&str, u32) + Send + Sync>,
}

impl SubscrInner {
    fn log_err(&self, err: YdsError) {
        tracing::warn!("Listener error: {}.", err);
        self.errors.lock().push(err);
    }
}

/// Serve all pending events of every subscription in the context once.
pub fn process_events(inner: &SubscrInner) -> YdsResult<()> {
    process_change_events(inner)?;
    process_oper_events(inner)?;
    process_rpc_events(inner)?;
    process_notif_events(inner)?;
    Ok(())
}

fn process_change_events(inner: &SubscrInner) -> YdsResult<()> {
    let mut state = inner.state.lock();
    let mut topics: Vec<(String, Datastore)> = state
        .change
        .iter()
        .map(|s| (s.module.clone(), s.ds))
        .collect();
    topics.sort();
    topics.dedup();

    for (module, ds) in topics {
        let mut slot = SubSlot::open(&change_slot_path(&inner.repo, &module, ds), true)?;
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let event = slot.event();
        let request_id = slot.request_id();
        let priority = slot.priority();
        if !event.is_listen() {
            slot.unlock(LockMode::Read);
            continue;
        }
        let payload: ChangePayload = if slot.payload().is_empty() {
            ChangePayload {
                diff: DiffTree::new(),
            }
        } else {
            lyb::decode_payload(slot.payload())?
        };
        slot.unlock(LockMode::Read);

        // Run the matching callbacks, then publish one combined reply.
        // Passive subscribers observe the event but never joined the
        // fan-in count.
        let mut served = 0u32;
        let mut cb_err: Option<CbError> = None;
        let mut update_edit = Edit::new();
        for sub in state.change.iter_mut().filter(|s| {
            s.module == module
                && s.ds == ds
                && s.priority == priority
                && (s.last_request_id != request_id || s.last_event != event)
        }) {
            let applicable = match event {
                EventCode::Update => sub.opts.contains(SubOptions::UPDATE),
                EventCode::Change | EventCode::Abort => !sub.opts.contains(SubOptions::DONE_ONLY),
                EventCode::Done | EventCode::Enabled => true,
                _ => false,
            };
            if !applicable {
                continue;
            }
            sub.last_request_id = request_id;
            sub.last_event = event;
            let passive = sub.opts.contains(SubOptions::PASSIVE);
            if !passive {
                served += 1;
            }

            let ev = ChangeEvent {
                module: &module,
                ds,
                event,
                diff: &payload.diff,
            };
            match (sub.cb)(&ev) {
                Ok(Some(edit)) if event == EventCode::Update => update_edit.merge(edit),
                Ok(_) => {}
                Err(e) if !passive && matches!(event, EventCode::Update | EventCode::Change) => {
                    cb_err.get_or_insert(e);
                }
                Err(_) => {}
            }
        }
        if served == 0 {
            continue;
        }

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        if slot.request_id() != request_id || slot.event() != event {
            // Dismissed or replaced while the callbacks ran.
            slot.unlock(LockMode::Write);
            continue;
        }
        if let Some(err) = cb_err {
            let bytes = lyb::encode_payload(&err)?;
            slot.write_reply(EventCode::Error, &bytes)?;
            for _ in 0..served {
                if slot.subscriber_count() == 0 {
                    break;
                }
                slot.dec_subscriber_count();
            }
        } else {
            let mut remaining = slot.subscriber_count();
            for _ in 0..served {
                if remaining == 0 {
                    break;
                }
                remaining = slot.dec_subscriber_count();
            }
            if remaining == 0 && slot.event() == event {
                match event {
                    EventCode::Update => {
                        let bytes = lyb::encode_payload(&UpdateReply { edit: update_edit })?;
                        slot.write_reply(EventCode::Success, &bytes)?;
                    }
                    EventCode::Change | EventCode::Enabled => {
                        slot.write_reply(EventCode::Success, &[])?;
                    }
                    _ => {
                        slot.write_reply(EventCode::None, &[])?;
                    }
                }
            }
        }
        slot.unlock(LockMode::Write);
    }
    Ok(())
}

fn process_oper_events(inner: &SubscrInner) -> YdsResult<()> {
    let mut state = inner.state.lock();
    for sub in state.oper.iter_mut() {
        let mut slot = SubSlot::open(&oper_slot_path(&inner.repo, &sub.module, &sub.xpath), false)?;
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let request_id = slot.request_id();
        if slot.event() != EventCode::Oper || request_id == sub.last_request_id {
            slot.unlock(LockMode::Read);
            continue;
        }
        let payload: OperPayload = lyb::decode_payload(slot.payload())?;
        slot.unlock(LockMode::Read);

        sub.last_request_id = request_id;
        let result = (sub.cb)(&payload.xpath, &payload.request_xpath);

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        if slot.request_id() == request_id && slot.event() == EventCode::Oper {
            match result {
                Ok(data) => {
                    let bytes = lyb::encode_payload(&OperReply { data })?;
                    slot.write_reply(EventCode::Success, &bytes)?;
                }
                Err(err) => {
                    let bytes = lyb::encode_payload(&err)?;
                    slot.write_reply(EventCode::Error, &bytes)?;
                }
            }
        }
        slot.unlock(LockMode::Write);
    }
    Ok(())
}

fn process_rpc_events(inner: &SubscrInner) -> YdsResult<()> {
    let mut state = inner.state.lock();
    let mut topics: Vec<(String, String)> = state
        .rpc
        .iter()
        .map(|s| (s.module.clone(), s.op_path.clone()))
        .collect();
    topics.sort();
    topics.dedup();

    for (module, op_path) in topics {
        let mut slot = SubSlot::open(&rpc_slot_path(&inner.repo, &module, &op_path), true)?;
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let event = slot.event();
        let request_id = slot.request_id();
        let priority = slot.priority();
        if !matches!(event, EventCode::Rpc | EventCode::Abort) {
            slot.unlock(LockMode::Read);
            continue;
        }
        let payload: RpcPayload = lyb::decode_payload(slot.payload())?;
        slot.unlock(LockMode::Read);

        let mut served = 0u32;
        let mut cb_err: Option<CbError> = None;
        let mut output: Option<DataNode> = None;
        for sub in state.rpc.iter_mut().filter(|s| {
            s.module == module
                && s.op_path == op_path
                && s.priority == priority
                && (s.last_request_id != request_id || s.last_event != event)
        }) {
            sub.last_request_id = request_id;
            sub.last_event = event;
            served += 1;
            if event == EventCode::Rpc {
                match (sub.cb)(&payload.input) {
                    Ok(out) => output = Some(out),
                    Err(e) => {
                        cb_err.get_or_insert(e);
                    }
                }
            }
        }
        if served == 0 {
            continue;
        }

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        if slot.request_id() != request_id || slot.event() != event {
            slot.unlock(LockMode::Write);
            continue;
        }
        if let Some(err) = cb_err {
            let bytes = lyb::encode_payload(&err)?;
            slot.write_reply(EventCode::Error, &bytes)?;
            for _ in 0..served {
                if slot.subscriber_count() == 0 {
                    break;
                }
                slot.dec_subscriber_count();
            }
        } else {
            let mut remaining = slot.subscriber_count();
            for _ in 0..served {
                if remaining == 0 {
                    break;
                }
                remaining = slot.dec_subscriber_count();
            }
            if remaining == 0 && slot.event() == event {
                if event == EventCode::Rpc {
                    let out = output.unwrap_or_else(|| payload.input.clone());
                    let bytes = lyb::encode_payload(&RpcReply { output: out })?;
                    slot.write_reply(EventCode::Success, &bytes)?;
                } else {
                    slot.write_reply(EventCode::None, &[])?;
                }
            }
        }
        slot.unlock(LockMode::Write);
    }
    Ok(())
}

fn process_notif_events(inner: &SubscrInner) -> YdsResult<()> {
    let mut state = inner.state.lock();
    let mut modules: Vec<String> = state.notif.iter().map(|s| s.module.clone()).collect();
    modules.sort();
    modules.dedup();

    for module in modules {
        let mut slot = SubSlot::open(&notif_slot_path(&inner.repo, &module), true)?;
        slot.lock(LockMode::Read, SLOT_LOCK_TIMEOUT_MS)?;
        let request_id = slot.request_id();
        if slot.event() != EventCode::Notif {
            slot.unlock(LockMode::Read);
            continue;
        }
        let payload: NotifPayload = lyb::decode_payload(slot.payload())?;
        slot.unlock(LockMode::Read);

        let mut served = 0u32;
        for sub in state.notif.iter_mut().filter(|s| {
            s.module == module && !s.suspended && s.last_request_id != request_id
        }) {
            sub.last_request_id = request_id;
            served += 1;
            if sub.stop_time.is_some_and(|st| payload.timestamp > st) {
                continue;
            }
            // Live events wait until a pending replay caught up.
            if sub.start_time.is_some() && !sub.replayed {
                continue;
            }
            (sub.cb)(NotifType::Realtime, payload.timestamp, Some(&payload.notif));
        }
        if served == 0 {
            continue;
        }

        slot.lock(LockMode::Write, SLOT_LOCK_TIMEOUT_MS)?;
        if slot.request_id() == request_id && slot.event() == EventCode::Notif {
            let mut remaining = slot.subscriber_count();
            for _ in 0..served {
                if remaining == 0 {
                    break;
                }
                remaining = slot.dec_subscriber_count();
            }
            if remaining == 0 {
                slot.write_reply(EventCode::None, &[])?;
            }
        }
        slot.unlock(LockMode::Write);
    }
    Ok(())
}

/// Run pending replays and finalize subscriptions whose stop time elapsed.
pub fn process_notif_replay_stop(inner: &SubscrInner) {
    let mut finished: Vec<(String, u32)> = Vec::new();
    {
        let mut state = inner.state.lock();
        let now = now_ts();
        for sub in state.notif.iter_mut() {
            if !sub.replayed {
                if let Some(start) = sub.start_time {
                    match notif_log::replay(&inner.repo, &sub.module, start, sub.stop_time) {
                        Ok(records) => {
                            for rec in records {
                                (sub.cb)(NotifType::Replay, rec.timestamp, Some(&rec.notif));
                            }
                            (sub.cb)(NotifType::ReplayComplete, now, None);
                        }
                        Err(e) => inner.log_err(e),
                    }
                }
                sub.replayed = true;
            }
            if sub.stop_time.is_some_and(|st| now >= st) {
                (sub.cb)(NotifType::Stop, now, None);
                finished.push((sub.module.clone(), sub.sub_id));
            }
        }
        state
            .notif
            .retain(|s| !finished.iter().any(|(_, id)| *id == s.sub_id));
    }
    for (module, sub_id) in finished {
        (inner.notif_finisher)(&module, sub_id);
    }
}

/// The listener worker: poll the event pipe, drain it, serve events, and
/// watch notification replay and stop times. Ends on the stop flag or a
/// stop token.
pub fn listen_loop(inner: Arc<SubscrInner>, mut pipe: std::fs::File) {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    tracing::debug!("Listener of event pipe {} started.", inner.evpipe_num);
    loop {
        if inner.stop.load(Ordering::Acquire) {
            break;
        }

        let mut fds = [PollFd::new(pipe.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(LOOP_POLL_MS)) {
            Ok(0) => {}
            Ok(_) => {
                if evpipe::drain(&mut pipe) {
                    break;
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                inner.log_err(YdsError::Sys {
                    path: inner.repo.evpipe_path(inner.evpipe_num).display().to_string(),
                    errno: e.desc().to_string(),
                });
                break;
            }
        }

        if let Err(e) = process_events(&inner) {
            inner.log_err(e);
        }
        process_notif_replay_stop(&inner);
    }
    tracing::debug!("Listener of event pipe {} finished.", inner.evpipe_num);
}
