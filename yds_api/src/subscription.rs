//! Subscription contexts: registration, the listener worker, teardown.

use crate::connection::ConnInner;
use crate::session::Session;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use yds_common::{LockMode, SubOptions, YdsError, YdsResult};
use yds_shm::layout::{OPER_SUB_CONFIG, OPER_SUB_MIXED, OPER_SUB_STATE};
use yds_shm::{conn, mod_sub};
use yds_sub::dispatch::{
    self, change_slot_path, notif_slot_path, oper_slot_path, rpc_slot_path,
};
use yds_sub::evpipe;
use yds_sub::listen::{
    self, ChangeCallback, ChangeSubState, NotifCallback, NotifSubState, OperCallback,
    OperSubState, RpcCallback, RpcSubState, SubscrInner, SubscrState,
};
use yds_sub::slot::{EventCode, SubSlot};

/// Kind of data an operational provider supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperSubType {
    /// State data.
    State,
    /// Configuration data.
    Config,
    /// Both.
    Mixed,
}

impl OperSubType {
    fn as_u32(self) -> u32 {
        match self {
            OperSubType::State => OPER_SUB_STATE,
            OperSubType::Config => OPER_SUB_CONFIG,
            OperSubType::Mixed => OPER_SUB_MIXED,
        }
    }
}

/// A subscription context: owns one event pipe and a listener worker
/// serving every subscription registered through it. Dropping the context
/// unsubscribes everything.
pub struct Subscription {
    conn: Arc<ConnInner>,
    inner: Arc<SubscrInner>,
    evpipe_num: u32,
    no_thread: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Subscription {
    /// Create an empty context on `session`'s connection. With
    /// `SubOptions::NO_THREAD` no worker is spawned and the caller drives
    /// [`Subscription::process_events`] itself.
    pub fn new(session: &Session, opts: SubOptions) -> YdsResult<Subscription> {
        let conn = Arc::clone(&session.conn);
        let evpipe_num = {
            let mut shm = conn.shm.lock();
            let num = shm.new_evpipe_num();
            evpipe::create(&conn.repo, num)?;
            shm.lock_remap(LockMode::Write, LockMode::Write)?;
            let res = conn::conn_evpipe_add(&mut shm, conn.cid, num);
            shm.unlock(LockMode::Write, LockMode::Write);
            res?;
            num
        };

        let finisher_conn = Arc::clone(&conn);
        let inner = Arc::new(SubscrInner {
            repo: conn.repo.clone(),
            cid: conn.cid,
            evpipe_num,
            state: Mutex::new(SubscrState::default()),
            stop: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            notif_finisher: Box::new(move |module, sub_id| {
                let mut shm = finisher_conn.shm.lock();
                if shm.lock_remap(LockMode::Write, LockMode::Write).is_ok() {
                    if let Some(idx) = shm.find_module(module) {
                        let mut last = false;
                        mod_sub::notif_sub_del(&mut shm, idx, sub_id, 0, &mut last);
                    }
                    shm.unlock(LockMode::Write, LockMode::Write);
                }
            }),
        });

        let no_thread = opts.contains(SubOptions::NO_THREAD);
        let thread = if no_thread {
            None
        } else {
            let pipe = evpipe::open_read(&conn.repo, evpipe_num)?;
            let worker_inner = Arc::clone(&inner);
            Some(std::thread::spawn(move || {
                listen::listen_loop(worker_inner, pipe)
            }))
        };

        Ok(Subscription {
            conn,
            inner,
            evpipe_num,
            no_thread,
            thread,
        })
    }

    /// Event pipe number of this context.
    pub fn evpipe_num(&self) -> u32 {
        self.evpipe_num
    }

    /// Serve pending events once; only for `NO_THREAD` contexts.
    pub fn process_events(&self) -> YdsResult<()> {
        if !self.no_thread {
            return Err(YdsError::InvalArg {
                msg: "The context runs its own listener worker.".to_string(),
            });
        }
        listen::process_events(&self.inner)?;
        listen::process_notif_replay_stop(&self.inner);
        Ok(())
    }

    /// Errors the listener hit while serving events.
    pub fn take_errors(&self) -> Vec<YdsError> {
        std::mem::take(&mut self.inner.errors.lock())
    }

    /// Subscribe to changes of `module` in the session's datastore. With
    /// `SubOptions::ENABLED` the callback first receives an Enabled event
    /// carrying the current data; its refusal cancels the subscription.
    pub fn module_change_subscribe(
        &mut self,
        session: &Session,
        module: &str,
        xpath: Option<&str>,
        priority: u32,
        opts: SubOptions,
        mut callback: ChangeCallback,
    ) -> YdsResult<()> {
        let ds = session.datastore();

        if opts.contains(SubOptions::ENABLED) {
            let filter = xpath
                .map(str::to_string)
                .unwrap_or_else(|| format!("/{}:*", module));
            let current = session.get_data(&filter)?;
            let diff =
                yds_data::diff::forest_diff(&yds_data::tree::DataForest::new(), &current);
            let ev = listen::ChangeEvent {
                module,
                ds,
                event: EventCode::Enabled,
                diff: &diff,
            };
            if let Err(e) = callback(&ev) {
                return Err(YdsError::CallbackFailed {
                    msg: e.msg,
                    xpath: e.xpath,
                });
            }
        }

        {
            let mut shm = self.conn.shm.lock();
            shm.lock_remap(LockMode::Write, LockMode::Write)?;
            let res = (|| {
                let idx = shm.find_module(module).ok_or_else(|| YdsError::NotFound {
                    msg: format!("Module \"{}\".", module),
                })?;
                mod_sub::change_sub_add(
                    &mut shm,
                    idx,
                    ds,
                    xpath,
                    priority,
                    opts.bits(),
                    self.evpipe_num,
                    self.conn.cid,
                )
            })();
            shm.unlock(LockMode::Write, LockMode::Write);
            res?;
        }

        self.inner.state.lock().change.push(ChangeSubState {
            module: module.to_string(),
            ds,
            xpath: xpath.map(str::to_string),
            priority,
            opts,
            last_request_id: 0,
            last_event: EventCode::None,
            cb: callback,
        });
        Ok(())
    }

    /// Subscribe as an operational data provider for `xpath`.
    pub fn oper_get_subscribe(
        &mut self,
        _session: &Session,
        module: &str,
        xpath: &str,
        sub_type: OperSubType,
        opts: SubOptions,
        callback: OperCallback,
    ) -> YdsResult<()> {
        {
            let mut shm = self.conn.shm.lock();
            shm.lock_remap(LockMode::Write, LockMode::Write)?;
            let res = (|| {
                let idx = shm.find_module(module).ok_or_else(|| YdsError::NotFound {
                    msg: format!("Module \"{}\".", module),
                })?;
                mod_sub::oper_sub_add(
                    &mut shm,
                    idx,
                    xpath,
                    sub_type.as_u32(),
                    opts.bits(),
                    self.evpipe_num,
                    self.conn.cid,
                )
            })();
            shm.unlock(LockMode::Write, LockMode::Write);
            res?;
        }

        self.inner.state.lock().oper.push(OperSubState {
            module: module.to_string(),
            xpath: xpath.to_string(),
            last_request_id: 0,
            cb: callback,
        });
        Ok(())
    }

    /// Subscribe to an RPC/action of `module`.
    pub fn rpc_subscribe(
        &mut self,
        _session: &Session,
        module: &str,
        op_name: &str,
        priority: u32,
        opts: SubOptions,
        callback: RpcCallback,
    ) -> YdsResult<()> {
        let op_path = format!("/{}:{}", module, op_name);
        {
            let mut shm = self.conn.shm.lock();
            shm.lock_remap(LockMode::Write, LockMode::Write)?;
            let res = (|| {
                let rpc_idx = mod_sub::rpc_add(&mut shm, &op_path)?;
                mod_sub::rpc_sub_add(
                    &mut shm,
                    rpc_idx,
                    &op_path,
                    priority,
                    opts.bits(),
                    self.evpipe_num,
                    self.conn.cid,
                )
            })();
            shm.unlock(LockMode::Write, LockMode::Write);
            res?;
        }

        self.inner.state.lock().rpc.push(RpcSubState {
            module: module.to_string(),
            op_path,
            priority,
            last_request_id: 0,
            last_event: EventCode::None,
            cb: callback,
        });
        Ok(())
    }

    /// Subscribe to notifications of `module`, optionally replaying logged
    /// ones from `start_time` and stopping at `stop_time`. Returns the
    /// subscription id.
    pub fn notif_subscribe(
        &mut self,
        _session: &Session,
        module: &str,
        start_time: Option<u64>,
        stop_time: Option<u64>,
        callback: NotifCallback,
    ) -> YdsResult<u32> {
        let sub_id = {
            let mut shm = self.conn.shm.lock();
            shm.lock_remap(LockMode::Write, LockMode::Write)?;
            let res = (|| {
                let idx = shm.find_module(module).ok_or_else(|| YdsError::NotFound {
                    msg: format!("Module \"{}\".", module),
                })?;
                let sub_id = shm.new_sub_id();
                mod_sub::notif_sub_add(&mut shm, idx, sub_id, self.evpipe_num, self.conn.cid)?;
                Ok(sub_id)
            })();
            shm.unlock(LockMode::Write, LockMode::Write);
            res?
        };

        self.inner.state.lock().notif.push(NotifSubState {
            module: module.to_string(),
            sub_id,
            start_time,
            stop_time,
            suspended: false,
            replayed: false,
            last_request_id: 0,
            cb: callback,
        });
        // Wake the worker so a pending replay or an elapsed stop time is
        // handled promptly.
        evpipe::notify(&self.conn.repo, self.evpipe_num, evpipe::TOKEN_EVENT)?;
        Ok(sub_id)
    }

    fn unsubscribe_all(&mut self) {
        let state = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut *state)
        };

        let mut shm = self.conn.shm.lock();
        if let Err(e) = shm.lock_remap(LockMode::Write, LockMode::Write) {
            tracing::warn!("Unsubscribe failed to lock main SHM: {}.", e);
            return;
        }

        for sub in &state.change {
            if let Ok(mut slot) =
                SubSlot::open(&change_slot_path(&self.conn.repo, &sub.module, sub.ds), true)
            {
                let _ = dispatch::dismiss_multi(&mut slot);
            }
            if let Some(idx) = shm.find_module(&sub.module) {
                let mut last = false;
                mod_sub::change_sub_del(
                    &mut shm,
                    idx,
                    sub.ds,
                    sub.xpath.as_deref(),
                    sub.priority,
                    self.evpipe_num,
                    false,
                    &mut last,
                );
            }
        }
        for sub in &state.oper {
            if let Ok(mut slot) =
                SubSlot::open(&oper_slot_path(&self.conn.repo, &sub.module, &sub.xpath), false)
            {
                let _ = dispatch::dismiss_single(&mut slot);
            }
            if let Some(idx) = shm.find_module(&sub.module) {
                mod_sub::oper_sub_del(&mut shm, idx, Some(&sub.xpath), self.evpipe_num, false);
            }
        }
        for sub in &state.rpc {
            if let Ok(mut slot) =
                SubSlot::open(&rpc_slot_path(&self.conn.repo, &sub.module, &sub.op_path), true)
            {
                let _ = dispatch::dismiss_multi(&mut slot);
            }
            if let Some(rpc_idx) = shm.find_rpc(&sub.op_path) {
                let mut last = false;
                mod_sub::rpc_sub_del(
                    &mut shm,
                    rpc_idx,
                    Some(&sub.op_path),
                    sub.priority,
                    self.evpipe_num,
                    false,
                    &mut last,
                );
                if last {
                    let _ = mod_sub::rpc_del(&mut shm, rpc_idx);
                }
            }
        }
        for sub in &state.notif {
            if let Ok(mut slot) =
                SubSlot::open(&notif_slot_path(&self.conn.repo, &sub.module), true)
            {
                let _ = dispatch::dismiss_multi(&mut slot);
            }
            if let Some(idx) = shm.find_module(&sub.module) {
                let mut last = false;
                mod_sub::notif_sub_del(&mut shm, idx, sub.sub_id, self.evpipe_num, &mut last);
            }
        }

        if let Err(e) = conn::conn_evpipe_del(&mut shm, self.conn.cid, self.evpipe_num) {
            tracing::debug!("Event pipe {} already unregistered: {}.", self.evpipe_num, e);
        }
        shm.unlock(LockMode::Write, LockMode::Write);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        let _ = evpipe::notify(&self.conn.repo, self.evpipe_num, evpipe::TOKEN_STOP);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.unsubscribe_all();
        evpipe::unlink(&self.conn.repo, self.evpipe_num);
    }
}
