//! The engine driver: one phase pipeline per operation kind.
//!
//! A write runs collect, permission check, ordered locking, load, edit
//! application, validation, default fill, the multi-phase change protocol,
//! commit and the config-change notification. Reads share the front half
//! and pull operational providers instead of publishing. Every phase
//! returns early on error; nothing is persisted before the publish phase
//! succeeded, so failures before commit leave no trace.

use crate::cache::ModCache;
use crate::modinfo::{DepMode, ModInfo, ModRole};
use crate::store;
use yds_common::options::PermCheck;
use yds_common::{
    Cid, Datastore, GetOperOptions, LockMode, Repository, Sid, YdsError, YdsResult,
};
use yds_data::diff::DiffTree;
use yds_data::edit::Edit;
use yds_data::path::Path;
use yds_data::schema::{NodeKind, SchemaModule};
use yds_data::tree::{DataForest, DataNode};
use yds_shm::main_shm::ShmMain;
use yds_shm::manifest::Manifest;
use yds_shm::mod_sub;
use yds_shm::sync::{self, MOD_LOCK_TIMEOUT_MS};
use yds_sub::dispatch;
use yds_sub::notif_log;
use yds_sub::recovery::recovery_sweep;

/// Module name of configuration-change notifications.
pub const NOTIF_MODULE: &str = "netconf-notifications";

/// One engine invocation context, borrowing the connection's shared state.
pub struct Engine<'a> {
    /// Mapped coordination segments.
    pub shm: &'a mut ShmMain,
    /// Repository layout.
    pub repo: &'a Repository,
    /// Installed module schemas.
    pub manifest: &'a Manifest,
    /// Running-data cache, when the connection enabled it.
    pub cache: Option<&'a ModCache>,
    /// Calling connection.
    pub cid: Cid,
    /// Originating session.
    pub sid: Sid,
}

impl<'a> Engine<'a> {
    fn schema(&self, module: &str) -> YdsResult<&SchemaModule> {
        self.manifest.schema(module).ok_or_else(|| YdsError::NotFound {
            msg: format!("Schema of module \"{}\".", module),
        })
    }

    /// Lock main SHM for an engine entry. Write and read-upgradeable
    /// entries sweep dead connections first.
    pub fn shm_lock(&mut self, mode: LockMode, remap: LockMode) -> YdsResult<()> {
        self.shm.lock_remap(mode, remap)?;
        let recover = match mode {
            LockMode::Write => true,
            LockMode::ReadUpgr => {
                if let Err(e) = self.shm.upgrade() {
                    self.shm.unlock(mode, remap);
                    return Err(e);
                }
                true
            }
            _ => false,
        };
        if recover {
            let res = recovery_sweep(self.shm, self.repo);
            if mode == LockMode::ReadUpgr {
                self.shm.downgrade();
            }
            if let Err(e) = res {
                self.shm.unlock(mode, remap);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unlock main SHM.
    pub fn shm_unlock(&mut self, mode: LockMode, remap: LockMode) {
        self.shm.unlock(mode, remap);
    }

    /// Apply an edit to a conventional or operational datastore. Returns
    /// the forward diff of everything that changed.
    pub fn apply_changes(
        &mut self,
        ds: Datastore,
        edit: &Edit,
        timeout_ms: u32,
    ) -> YdsResult<DiffTree> {
        if edit.is_empty() {
            return Ok(DiffTree::new());
        }
        let seeds: Vec<String> = edit.modules().iter().map(|m| m.to_string()).collect();

        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = self.apply_changes_main_locked(ds, &seeds, edit, timeout_ms);
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    fn apply_changes_main_locked(
        &mut self,
        ds: Datastore,
        seeds: &[String],
        edit: &Edit,
        timeout_ms: u32,
    ) -> YdsResult<DiffTree> {
        let mut info = ModInfo::collect(self.shm, ds, seeds, DepMode::DepsAndInverse)?;
        info.perm_check(self.repo, PermCheck::Write)?;

        info.wrlock(self.shm, self.cid, self.sid)?;
        let result = self.apply_changes_locked(&mut info, edit, timeout_ms);
        info.unlock(self.shm, self.cid);
        result.map(|()| info.diff)
    }

    fn apply_changes_locked(
        &mut self,
        info: &mut ModInfo,
        edit: &Edit,
        timeout_ms: u32,
    ) -> YdsResult<()> {
        info.check_ds_lock(self.shm, self.sid)?;
        info.load_data(self.shm, self.repo, self.cache, GetOperOptions::empty())?;

        // Apply the edit module by module, collecting the forward diff.
        let required: Vec<String> = info
            .mods
            .iter()
            .filter(|m| m.role == ModRole::Required)
            .map(|m| m.name.clone())
            .collect();
        for name in &required {
            let mut diff = DiffTree::new();
            let changed = edit.apply_module(name, &mut info.data, Some(&mut diff))?;
            if changed {
                info.diff.merge(&diff, None);
                if let Some(m) = info.mods.iter_mut().find(|m| m.name == *name) {
                    m.changed = true;
                }
            }
        }
        if !info.mods.iter().any(|m| m.changed) {
            return Ok(());
        }

        self.fill_defaults(info)?;
        self.validate(info)?;
        self.publish_and_commit(info, timeout_ms)
    }

    /// Materialize defaults (or NP containers for operational) in every
    /// required module, recording them as changes.
    fn fill_defaults(&mut self, info: &mut ModInfo) -> YdsResult<()> {
        let conventional = info.ds.is_conventional();
        for i in 0..info.mods.len() {
            if info.mods[i].role != ModRole::Required {
                continue;
            }
            let name = info.mods[i].name.clone();
            let schema = self.schema(&name)?;
            let mut nodes = info.data.unlink_module(&name);
            if conventional {
                let mut default_diffs = Vec::new();
                schema.add_defaults(&mut nodes, Some(&mut default_diffs));
                if !default_diffs.is_empty() {
                    let mut diff = DiffTree::new();
                    diff.extend_module(&name, default_diffs);
                    info.diff.merge(&diff, None);
                    info.mods[i].changed = true;
                }
            } else {
                schema.add_np_containers(&mut nodes);
            }
            info.data.set_module(&name, nodes);
        }
        Ok(())
    }

    /// Validate every changed module plus the inverse dependencies whose
    /// references may have broken.
    fn validate(&mut self, info: &ModInfo) -> YdsResult<()> {
        let conventional = info.ds.is_conventional();
        for m in info
            .mods
            .iter()
            .filter(|m| m.changed || m.role == ModRole::InvDep)
        {
            let schema = self.schema(&m.name)?;
            schema.validate(info.data.module_data(&m.name), conventional, &info.data)?;
        }
        Ok(())
    }

    /// Phases 8-10: update, change, commit, done, change notification.
    fn publish_and_commit(&mut self, info: &mut ModInfo, timeout_ms: u32) -> YdsResult<()> {
        let changed: Vec<(usize, String)> = info
            .mods
            .iter()
            .filter(|m| m.changed)
            .map(|m| (m.idx, m.name.clone()))
            .collect();

        // Update phase: collect amending edits, highest priority first.
        for (idx, name) in &changed {
            let subs = mod_sub::change_subs(self.shm, *idx, info.ds);
            let module_diff = info.diff.split_module(name);
            let (update_edit, cb_err) = dispatch::change_notify_update(
                self.repo,
                name,
                info.ds,
                &subs,
                &module_diff,
                self.sid,
                timeout_ms,
            )?;
            if let Some(err) = cb_err {
                return Err(YdsError::CallbackFailed {
                    msg: err.msg,
                    xpath: err.xpath,
                });
            }
            if !update_edit.is_empty() {
                let mut diff = DiffTree::new();
                if update_edit.apply_module(name, &mut info.data, Some(&mut diff))? {
                    info.diff.merge(&diff, None);
                }
            }
        }
        if changed
            .iter()
            .any(|(_, name)| !info.diff.split_module(name).is_empty())
        {
            self.validate(info)?;
        }

        // Change phase: the veto point. Any refusal aborts every module
        // and band already notified.
        let mut request_ids = Vec::with_capacity(changed.len());
        for (pos, (idx, name)) in changed.iter().enumerate() {
            let subs = mod_sub::change_subs(self.shm, *idx, info.ds);
            let module_diff = info.diff.split_module(name);
            let (request_id, failure) = dispatch::change_notify_change(
                self.repo,
                name,
                info.ds,
                &subs,
                &module_diff,
                self.sid,
                timeout_ms,
            )?;
            request_ids.push(request_id);

            if let Some((err, err_priority)) = failure {
                for (abort_pos, (a_idx, a_name)) in changed.iter().enumerate().take(pos + 1) {
                    let a_subs = mod_sub::change_subs(self.shm, *a_idx, info.ds);
                    let a_diff = info.diff.split_module(a_name);
                    let down_to = if abort_pos == pos { err_priority } else { 0 };
                    if let Err(e) = dispatch::change_notify_abort(
                        self.repo,
                        a_name,
                        info.ds,
                        &a_subs,
                        &a_diff,
                        self.sid,
                        request_ids[abort_pos],
                        down_to,
                    ) {
                        tracing::warn!("Abort of \"{}\" failed: {}.", a_name, e);
                    }
                }
                return Err(YdsError::CallbackFailed {
                    msg: err.msg,
                    xpath: err.xpath,
                });
            }
        }

        // Commit. From here on the change stands.
        store::store_changed(self.shm, self.repo, info, self.cache, self.cid)?;

        // Done phase, fire-and-forget.
        for (pos, (idx, name)) in changed.iter().enumerate() {
            let subs = mod_sub::change_subs(self.shm, *idx, info.ds);
            let module_diff = info.diff.split_module(name);
            if let Err(e) = dispatch::change_notify_done(
                self.repo,
                name,
                info.ds,
                &subs,
                &module_diff,
                self.sid,
                request_ids[pos],
            ) {
                tracing::warn!("Done notification of \"{}\" failed: {}.", name, e);
            }
        }

        // Config-change notification; failures do not undo the commit.
        if let Err(e) = self.generate_config_change_notif(info) {
            tracing::warn!("Config-change notification failed: {}.", e);
        }
        Ok(())
    }

    /// Generate the datastore-change notification when anyone listens.
    fn generate_config_change_notif(&mut self, info: &ModInfo) -> YdsResult<()> {
        if info.diff.is_empty() || info.ds == Datastore::Operational {
            return Ok(());
        }
        let Some(idx) = self.shm.find_module(NOTIF_MODULE) else {
            return Ok(());
        };
        let subs = mod_sub::notif_subs(self.shm, idx);
        let replay = self.shm.module(idx).flags & yds_shm::layout::MOD_FLAG_REPLAY_SUPPORT != 0;
        if subs.is_empty() && !replay {
            return Ok(());
        }

        let mut notif = DataNode::new("netconf-config-change");
        for (module, nodes) in &info.diff.modules {
            for node in nodes {
                let mut edit = DataNode::new("edit");
                edit.children
                    .push(DataNode::leaf("target", format!("/{}:{}", module, node.name)));
                edit.children.push(DataNode::leaf(
                    "operation",
                    match node.op {
                        yds_data::diff::DiffOp::Create => "create",
                        yds_data::diff::DiffOp::Delete => "delete",
                        yds_data::diff::DiffOp::Replace => "replace",
                        yds_data::diff::DiffOp::None => "none",
                    },
                ));
                notif.children.push(edit);
            }
        }
        let ts = notif_log::now_ts();
        if replay {
            self.log_notification(idx, NOTIF_MODULE, ts, &notif)?;
        }
        dispatch::notif_notify(self.repo, NOTIF_MODULE, &subs, ts, &notif, self.sid)
    }

    fn log_notification(
        &mut self,
        idx: usize,
        module: &str,
        timestamp: u64,
        notif: &DataNode,
    ) -> YdsResult<()> {
        let lock = self.shm.module_replay_lock_ptr(idx);
        unsafe {
            sync::rwlock_lock(lock, MOD_LOCK_TIMEOUT_MS, LockMode::Write, "replay")?;
        }
        let res = notif_log::append(self.repo, module, timestamp, notif);
        unsafe {
            sync::rwlock_unlock(lock, LockMode::Write);
        }
        res
    }

    /// Read data from a datastore, filtered by `filter`. Operational reads
    /// merge stored operational edits and pull matching providers.
    pub fn get_data(
        &mut self,
        ds: Datastore,
        filter: &Path,
        oper_opts: GetOperOptions,
        timeout_ms: u32,
    ) -> YdsResult<DataForest> {
        let seeds = vec![filter.module().to_string()];

        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = self.get_data_main_locked(ds, &seeds, filter, oper_opts, timeout_ms);
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    fn get_data_main_locked(
        &mut self,
        ds: Datastore,
        seeds: &[String],
        filter: &Path,
        oper_opts: GetOperOptions,
        timeout_ms: u32,
    ) -> YdsResult<DataForest> {
        let mut info = ModInfo::collect(self.shm, ds, seeds, DepMode::Deps)?;
        info.perm_check(self.repo, PermCheck::Read { strict: true })?;

        info.rdlock(self.shm, false, self.cid, self.sid)?;
        let result = self.get_data_locked(&mut info, filter, oper_opts, timeout_ms);
        info.unlock(self.shm, self.cid);
        result
    }

    fn get_data_locked(
        &mut self,
        info: &mut ModInfo,
        filter: &Path,
        oper_opts: GetOperOptions,
        timeout_ms: u32,
    ) -> YdsResult<DataForest> {
        info.load_data(self.shm, self.repo, self.cache, oper_opts)?;

        if info.ds == Datastore::Operational {
            self.fill_defaults(info)?;
            if !oper_opts.contains(GetOperOptions::NO_SUBS) {
                self.pull_providers(info, filter, oper_opts, timeout_ms)?;
            }
            self.filter_oper_kinds(info, oper_opts)?;
        } else {
            self.fill_defaults(info)?;
        }

        let mut result = info.data.filtered(filter);
        if !oper_opts.contains(GetOperOptions::WITH_ORIGIN) {
            for nodes in result.modules.values_mut() {
                for node in nodes.iter_mut() {
                    strip_origin(node);
                }
            }
        }
        Ok(result)
    }

    fn pull_providers(
        &mut self,
        info: &mut ModInfo,
        filter: &Path,
        oper_opts: GetOperOptions,
        timeout_ms: u32,
    ) -> YdsResult<()> {
        let required: Vec<(usize, String)> = info
            .mods
            .iter()
            .filter(|m| m.role == ModRole::Required)
            .map(|m| (m.idx, m.name.clone()))
            .collect();
        for (idx, name) in required {
            let subs = mod_sub::oper_subs(self.shm, idx);
            for sub in subs {
                let sub_path = match Path::parse(&sub.xpath) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                // Statically disjoint providers are never invoked.
                if sub_path.disjoint_with(filter) {
                    continue;
                }
                match sub.rec.sub_type {
                    yds_shm::layout::OPER_SUB_STATE
                        if oper_opts.contains(GetOperOptions::NO_STATE) =>
                    {
                        continue;
                    }
                    yds_shm::layout::OPER_SUB_CONFIG
                        if oper_opts.contains(GetOperOptions::NO_CONFIG) =>
                    {
                        continue;
                    }
                    _ => {}
                }

                let parent = info.data.module_data(&name).to_vec();
                let reply = dispatch::oper_notify(
                    self.repo,
                    &name,
                    &sub.xpath,
                    &filter.to_string(),
                    &parent,
                    self.sid,
                    sub.rec.evpipe_num,
                    timeout_ms,
                )?;
                match reply {
                    Ok(nodes) => {
                        let mut provided = DataForest::new();
                        provided.set_module(&name, nodes);
                        info.data.merge(provided, None);
                    }
                    Err(err) => {
                        return Err(YdsError::CallbackFailed {
                            msg: err.msg,
                            xpath: err.xpath,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `NO_STATE`/`NO_CONFIG` filtering using the schemas.
    fn filter_oper_kinds(&self, info: &mut ModInfo, oper_opts: GetOperOptions) -> YdsResult<()> {
        let no_state = oper_opts.contains(GetOperOptions::NO_STATE);
        let no_config = oper_opts.contains(GetOperOptions::NO_CONFIG);
        if !no_state && !no_config {
            return Ok(());
        }
        let names: Vec<String> = info.data.modules.keys().cloned().collect();
        for name in names {
            let schema = self.schema(&name)?;
            let mut nodes = info.data.unlink_module(&name);
            filter_config_level(&schema.nodes, &mut nodes, no_state, no_config);
            info.data.set_module(&name, nodes);
        }
        Ok(())
    }

    /// Invoke an RPC/action, driving the subscriber priority chain.
    pub fn send_rpc(
        &mut self,
        module: &str,
        input: &DataNode,
        timeout_ms: u32,
    ) -> YdsResult<DataNode> {
        let schema = self.schema(module)?;
        schema.validate_op(input, false)?;
        let op_path = format!("/{}:{}", module, input.name);

        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = self.send_rpc_main_locked(module, &op_path, input, timeout_ms);
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    fn send_rpc_main_locked(
        &mut self,
        module: &str,
        op_path: &str,
        input: &DataNode,
        timeout_ms: u32,
    ) -> YdsResult<DataNode> {
        let Some(rpc_idx) = self.shm.find_rpc(op_path) else {
            return Err(YdsError::NotFound {
                msg: format!("No subscriber for RPC \"{}\".", op_path),
            });
        };
        let subs = mod_sub::rpc_subs(self.shm, rpc_idx);
        let (request_id, outcome) = dispatch::rpc_notify(
            self.repo,
            module,
            op_path,
            &subs,
            input,
            self.sid,
            timeout_ms,
        )?;
        match outcome {
            Ok(output) => {
                self.schema(module)?.validate_op(&output, true)?;
                Ok(output)
            }
            Err((err, err_priority)) => {
                if let Err(e) = dispatch::rpc_notify_abort(
                    self.repo,
                    module,
                    op_path,
                    &subs,
                    input,
                    self.sid,
                    request_id,
                    err_priority,
                ) {
                    tracing::warn!("RPC abort of \"{}\" failed: {}.", op_path, e);
                }
                Err(YdsError::CallbackFailed {
                    msg: err.msg,
                    xpath: err.xpath,
                })
            }
        }
    }

    /// Deliver a notification, logging it first when replay is enabled.
    pub fn send_notif(&mut self, module: &str, notif: &DataNode, timestamp: u64) -> YdsResult<()> {
        self.schema(module)?.validate_op(notif, false)?;

        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = (|| {
            let idx = self.shm.find_module(module).ok_or_else(|| YdsError::NotFound {
                msg: format!("Module \"{}\".", module),
            })?;
            if self.shm.module(idx).flags & yds_shm::layout::MOD_FLAG_REPLAY_SUPPORT != 0 {
                self.log_notification(idx, module, timestamp, notif)?;
            }
            let subs = mod_sub::notif_subs(self.shm, idx);
            dispatch::notif_notify(self.repo, module, &subs, timestamp, notif, self.sid)
        })();
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    /// Take the protocol-level datastore lock on one module (or all).
    pub fn lock_ds(&mut self, module: Option<&str>, ds: Datastore) -> YdsResult<()> {
        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = self.ds_lock_change(module, ds, true);
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    /// Release the protocol-level datastore lock.
    pub fn unlock_ds(&mut self, module: Option<&str>, ds: Datastore) -> YdsResult<()> {
        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = self.ds_lock_change(module, ds, false);
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    fn ds_lock_change(&mut self, module: Option<&str>, ds: Datastore, lock: bool) -> YdsResult<()> {
        let seeds: Vec<String> = match module {
            Some(name) => vec![name.to_string()],
            None => (0..self.shm.mod_count())
                .map(|i| self.shm.module_name(i).to_string())
                .collect(),
        };
        let mut info = ModInfo::collect(self.shm, ds, &seeds, DepMode::None)?;
        info.perm_check(self.repo, PermCheck::Write)?;

        let mut acquired: Vec<usize> = Vec::new();
        let mut failed: Option<YdsError> = None;
        for i in 0..info.mods.len() {
            let idx = info.mods[i].idx;
            let ptr = self.shm.module_lock_ptr(idx, ds as usize);
            if let Err(e) = unsafe {
                sync::rwlock_lock(ptr, MOD_LOCK_TIMEOUT_MS, LockMode::Write, &info.mods[i].name)
            } {
                failed = Some(e);
                break;
            }
            let li = &mut self.shm.module_mut(idx).data_lock_info[ds as usize];
            if lock {
                if li.ds_locked != 0 && li.ds_owner_sid != self.sid.id {
                    failed = Some(YdsError::LockFailed {
                        msg: format!(
                            "Module \"{}\" is datastore-locked by session {}.",
                            info.mods[i].name, li.ds_owner_sid
                        ),
                    });
                } else {
                    li.ds_locked = 1;
                    li.ds_owner_sid = self.sid.id;
                    li.ds_owner_cid = self.cid;
                    li.ds_ts = notif_log::now_ts() as i64;
                    acquired.push(idx);
                }
            } else if li.ds_locked != 0 && li.ds_owner_sid == self.sid.id {
                li.ds_locked = 0;
                li.ds_owner_sid = 0;
                li.ds_owner_cid = 0;
                li.ds_ts = 0;
            }
            unsafe {
                sync::rwlock_unlock(ptr, LockMode::Write);
            }
            if failed.is_some() {
                break;
            }
        }

        if let Some(err) = failed {
            // All-or-nothing: give back what was taken.
            for idx in acquired {
                let li = &mut self.shm.module_mut(idx).data_lock_info[ds as usize];
                li.ds_locked = 0;
                li.ds_owner_sid = 0;
                li.ds_owner_cid = 0;
                li.ds_ts = 0;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drop candidate files so the candidate mirrors running again, for
    /// the given modules (all when `None`).
    pub fn candidate_reset(&mut self, modules: Option<&[String]>) -> YdsResult<()> {
        let seeds: Vec<String> = match modules {
            Some(m) => m.to_vec(),
            None => (0..self.shm.mod_count())
                .map(|i| self.shm.module_name(i).to_string())
                .collect(),
        };
        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = (|| {
            let mut info = ModInfo::collect(self.shm, Datastore::Candidate, &seeds, DepMode::None)?;
            info.perm_check(self.repo, PermCheck::Write)?;
            info.wrlock(self.shm, self.cid, self.sid)?;
            let res = store::candidate_reset(self.repo, &info);
            info.unlock(self.shm, self.cid);
            res
        })();
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }

    /// Replace the content of `to_ds` with the content of `from_ds` for
    /// the given modules (all when `None`), publishing change events.
    pub fn copy_config(
        &mut self,
        from_ds: Datastore,
        to_ds: Datastore,
        modules: Option<&[String]>,
        timeout_ms: u32,
    ) -> YdsResult<DiffTree> {
        let seeds: Vec<String> = match modules {
            Some(m) => m.to_vec(),
            None => (0..self.shm.mod_count())
                .map(|i| self.shm.module_name(i).to_string())
                .collect(),
        };
        if seeds.is_empty() {
            return Ok(DiffTree::new());
        }

        self.shm_lock(LockMode::Read, LockMode::Read)?;
        let result = (|| {
            // Source data, under read locks.
            let mut src_info = ModInfo::collect(self.shm, from_ds, &seeds, DepMode::None)?;
            src_info.perm_check(self.repo, PermCheck::Read { strict: true })?;
            src_info.rdlock(self.shm, false, self.cid, self.sid)?;
            let loaded = src_info.load_data(self.shm, self.repo, self.cache, GetOperOptions::empty());
            src_info.unlock(self.shm, self.cid);
            loaded?;
            let src_data = src_info.data;

            // Target: diff, replace, publish, commit.
            let mut info = ModInfo::collect(self.shm, to_ds, &seeds, DepMode::DepsAndInverse)?;
            info.perm_check(self.repo, PermCheck::Write)?;
            info.wrlock(self.shm, self.cid, self.sid)?;
            let result = (|| {
                info.check_ds_lock(self.shm, self.sid)?;
                info.load_data(self.shm, self.repo, self.cache, GetOperOptions::empty())?;

                let diff = yds_data::diff::forest_diff(&info.data, &src_data);
                for name in seeds.iter() {
                    let module_part = diff.split_module(name);
                    if !module_part.is_empty() {
                        info.data.set_module(name, src_data.module_data(name).to_vec());
                        info.diff.merge(&module_part, None);
                        if let Some(m) = info.mods.iter_mut().find(|m| m.name == *name) {
                            m.changed = true;
                        }
                    }
                }
                if !info.mods.iter().any(|m| m.changed) {
                    return Ok(());
                }
                self.fill_defaults(&mut info)?;
                self.validate(&info)?;
                self.publish_and_commit(&mut info, timeout_ms)
            })();
            info.unlock(self.shm, self.cid);
            result.map(|()| info.diff)
        })();
        self.shm_unlock(LockMode::Read, LockMode::Read);
        result
    }
}

fn strip_origin(node: &mut DataNode) {
    node.origin_cid = None;
    for child in &mut node.children {
        strip_origin(child);
    }
}

fn filter_config_level(
    schema_level: &[yds_data::schema::SchemaNode],
    nodes: &mut Vec<DataNode>,
    no_state: bool,
    no_config: bool,
) {
    nodes.retain_mut(|node| {
        let Some(schema) = schema_level.iter().find(|s| s.name == node.name) else {
            return true;
        };
        let is_state = !schema.config;
        if is_state && no_state {
            return false;
        }
        if !is_state && no_config && matches!(schema.kind, NodeKind::Leaf { .. }) {
            return false;
        }
        filter_config_level(&schema.children, &mut node.children, no_state, no_config);
        true
    });
}
