//! Transient per-operation module state: dependency closure, permission
//! checks, ordered locking and data loading.

use crate::cache::ModCache;
use yds_common::options::PermCheck;
use yds_common::{Cid, Datastore, GetOperOptions, LockMode, Repository, Sid, YdsError, YdsResult};
use yds_data::diff::DiffTree;
use yds_data::files;
use yds_data::tree::DataForest;
use yds_shm::layout::{DEP_REF, DataDepShm};
use yds_shm::main_shm::ShmMain;
use yds_shm::sync::{self, MOD_LOCK_TIMEOUT_MS};

/// Role of a module inside one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModRole {
    /// Directly targeted by the operation.
    Required,
    /// Pulled in through data dependencies.
    Dep,
    /// Pulled in as an inverse dependency of a required module.
    InvDep,
}

/// One module inside a [`ModInfo`].
pub struct ModInfoMod {
    /// Index in main SHM.
    pub idx: usize,
    /// Module name.
    pub name: String,
    /// Ext offset of the name; the deterministic lock ordering key.
    pub order_key: u64,
    /// Role in this operation.
    pub role: ModRole,
    /// Whether the module's data is in [`ModInfo::data`].
    pub loaded: bool,
    /// Whether the operation changed this module.
    pub changed: bool,
    /// Lock currently held on the module's data.
    pub lock_held: Option<LockMode>,
}

/// Transient state of a single engine invocation.
pub struct ModInfo {
    /// Target datastore.
    pub ds: Datastore,
    /// Involved modules, sorted by lock order after [`ModInfo::collect`].
    pub mods: Vec<ModInfoMod>,
    /// Merged data of all loaded modules.
    pub data: DataForest,
    /// Accumulated forward diff.
    pub diff: DiffTree,
}

/// Which dependency closure to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepMode {
    /// Seeds only.
    None,
    /// Seeds plus transitive data dependencies.
    Deps,
    /// Seeds, transitive dependencies, and one hop of inverse
    /// dependencies of the seeds (write validation).
    DepsAndInverse,
}

fn module_dep_targets(shm: &ShmMain, idx: usize) -> Vec<String> {
    let m = shm.module(idx);
    let deps = unsafe {
        shm.ext
            .slice_at::<DataDepShm>(m.data_deps as usize, m.data_dep_count as usize)
    };
    deps.iter()
        .filter(|d| d.dep_type == DEP_REF && d.module != 0)
        .map(|d| shm.ext.str_at(d.module as usize).to_string())
        .collect()
}

fn module_inv_dep_targets(shm: &ShmMain, idx: usize) -> Vec<String> {
    let m = shm.module(idx);
    let invs = unsafe {
        shm.ext
            .slice_at::<u64>(m.inv_data_deps as usize, m.inv_data_dep_count as usize)
    };
    invs.iter()
        .map(|off| shm.ext.str_at(*off as usize).to_string())
        .collect()
}

impl ModInfo {
    /// Build the module set for an operation: seed modules as required,
    /// then the requested dependency closure.
    pub fn collect(
        shm: &ShmMain,
        ds: Datastore,
        seeds: &[String],
        dep_mode: DepMode,
    ) -> YdsResult<ModInfo> {
        let mut info = ModInfo {
            ds,
            mods: Vec::new(),
            data: DataForest::new(),
            diff: DiffTree::new(),
        };
        for name in seeds {
            let idx = shm.find_module(name).ok_or_else(|| YdsError::NotFound {
                msg: format!("Module \"{}\".", name),
            })?;
            info.add_mod(shm, idx, ModRole::Required);
        }
        if dep_mode == DepMode::None {
            return Ok(info);
        }

        // Transitive data dependencies.
        let mut frontier: Vec<usize> = info.mods.iter().map(|m| m.idx).collect();
        while let Some(idx) = frontier.pop() {
            for target in module_dep_targets(shm, idx) {
                let Some(dep_idx) = shm.find_module(&target) else {
                    continue;
                };
                if info.add_mod(shm, dep_idx, ModRole::Dep) {
                    frontier.push(dep_idx);
                }
            }
        }

        // One hop of inverse dependencies of the seeds.
        if dep_mode == DepMode::DepsAndInverse {
            let seeds_idx: Vec<usize> = info
                .mods
                .iter()
                .filter(|m| m.role == ModRole::Required)
                .map(|m| m.idx)
                .collect();
            for idx in seeds_idx {
                for target in module_inv_dep_targets(shm, idx) {
                    if let Some(inv_idx) = shm.find_module(&target) {
                        info.add_mod(shm, inv_idx, ModRole::InvDep);
                    }
                }
            }
        }

        // Deterministic lock order.
        info.mods.sort_by_key(|m| m.order_key);
        Ok(info)
    }

    fn add_mod(&mut self, shm: &ShmMain, idx: usize, role: ModRole) -> bool {
        if self.mods.iter().any(|m| m.idx == idx) {
            return false;
        }
        self.mods.push(ModInfoMod {
            idx,
            name: shm.module_name(idx).to_string(),
            order_key: shm.module_order_key(idx),
            role,
            loaded: false,
            changed: false,
            lock_held: None,
        });
        true
    }

    /// Module entry by name.
    pub fn module(&self, name: &str) -> Option<&ModInfoMod> {
        self.mods.iter().find(|m| m.name == name)
    }

    /// Verify the caller's access to every required module's startup file.
    /// Non-strict read drops inaccessible modules instead of failing.
    pub fn perm_check(&mut self, repo: &Repository, check: PermCheck) -> YdsResult<()> {
        let (write, strict) = match check {
            PermCheck::None => return Ok(()),
            PermCheck::Read { strict } => (false, strict),
            PermCheck::Write => (true, true),
        };
        let mut i = 0;
        while i < self.mods.len() {
            let keep = {
                let m = &self.mods[i];
                if m.role != ModRole::Required && !m.changed {
                    true
                } else {
                    let path = repo.data_path(&m.name, Datastore::Startup);
                    let mode = if write {
                        nix::unistd::AccessFlags::W_OK
                    } else {
                        nix::unistd::AccessFlags::R_OK
                    };
                    match nix::unistd::access(&path, mode) {
                        Ok(()) => true,
                        Err(nix::errno::Errno::ENOENT) => true,
                        Err(errno) => {
                            if strict {
                                return Err(YdsError::from_errno(
                                    path.display().to_string(),
                                    errno,
                                ));
                            }
                            tracing::info!(
                                "No {} permission for module \"{}\", skipping.",
                                if write { "write" } else { "read" },
                                self.mods[i].name
                            );
                            false
                        }
                    }
                }
            };
            if keep {
                i += 1;
            } else {
                self.mods.remove(i);
            }
        }
        Ok(())
    }

    unsafe fn lock_one(
        &mut self,
        shm: &mut ShmMain,
        i: usize,
        mode: LockMode,
        cid: Cid,
        sid: Sid,
    ) -> YdsResult<()> {
        let (idx, ds) = (self.mods[i].idx, self.ds as usize);
        let ptr = shm.module_lock_ptr(idx, ds);
        unsafe {
            sync::rwlock_lock(ptr, MOD_LOCK_TIMEOUT_MS, mode, &self.mods[i].name)?;
        }
        if mode == LockMode::Write {
            let li = &mut shm.module_mut(idx).data_lock_info[ds];
            li.write_owner_cid = cid;
            li.ds_owner_sid = sid.id;
        }
        self.mods[i].lock_held = Some(mode);
        Ok(())
    }

    /// READ lock every module, in ext-offset order. With `upgradeable`,
    /// required modules take the read-upgradeable mode instead.
    pub fn rdlock(
        &mut self,
        shm: &mut ShmMain,
        upgradeable: bool,
        cid: Cid,
        sid: Sid,
    ) -> YdsResult<()> {
        for i in 0..self.mods.len() {
            let mode = if upgradeable && self.mods[i].role == ModRole::Required {
                LockMode::ReadUpgr
            } else {
                LockMode::Read
            };
            if let Err(e) = unsafe { self.lock_one(shm, i, mode, cid, sid) } {
                self.unlock(shm, cid);
                return Err(e);
            }
        }
        Ok(())
    }

    /// WRITE lock required modules, READ lock their dependency companions,
    /// in ext-offset order.
    pub fn wrlock(&mut self, shm: &mut ShmMain, cid: Cid, sid: Sid) -> YdsResult<()> {
        for i in 0..self.mods.len() {
            let mode = if self.mods[i].role == ModRole::Required {
                LockMode::Write
            } else {
                LockMode::Read
            };
            if let Err(e) = unsafe { self.lock_one(shm, i, mode, cid, sid) } {
                self.unlock(shm, cid);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release every held module lock.
    pub fn unlock(&mut self, shm: &mut ShmMain, cid: Cid) {
        let ds = self.ds as usize;
        for m in self.mods.iter_mut() {
            if let Some(mode) = m.lock_held.take() {
                if mode == LockMode::Write {
                    let li = &mut shm.module_mut(m.idx).data_lock_info[ds];
                    if li.write_owner_cid == cid {
                        li.write_owner_cid = 0;
                    }
                }
                unsafe {
                    sync::rwlock_unlock(shm.module_lock_ptr(m.idx, ds), mode);
                }
            }
        }
    }

    /// Reject the operation when another session holds the datastore lock
    /// on a required module.
    pub fn check_ds_lock(&self, shm: &ShmMain, sid: Sid) -> YdsResult<()> {
        let ds = self.ds as usize;
        for m in self.mods.iter().filter(|m| m.role == ModRole::Required) {
            let li = &shm.module(m.idx).data_lock_info[ds];
            if li.ds_locked != 0 && li.ds_owner_sid != sid.id {
                return Err(YdsError::LockFailed {
                    msg: format!(
                        "Module \"{}\" is datastore-locked by session {}.",
                        m.name, li.ds_owner_sid
                    ),
                });
            }
        }
        Ok(())
    }

    /// Load data of every not-yet-loaded module. Running data may come
    /// from the process cache; operational data is running plus the stored
    /// operational edits (providers are pulled by the engine afterwards).
    pub fn load_data(
        &mut self,
        shm: &ShmMain,
        repo: &Repository,
        cache: Option<&ModCache>,
        oper_opts: GetOperOptions,
    ) -> YdsResult<()> {
        for i in 0..self.mods.len() {
            if self.mods[i].loaded {
                continue;
            }
            let name = self.mods[i].name.clone();
            let version = shm.module(self.mods[i].idx).ver;

            let base_ds = match self.ds {
                Datastore::Operational => Datastore::Running,
                other => other,
            };
            let mut nodes = match (base_ds, cache) {
                (Datastore::Running, Some(cache)) => match cache.get_current(&name, version) {
                    Some(data) => data,
                    None => {
                        let data = files::load_module_data(repo, &name, Datastore::Running)?
                            .unwrap_or_default();
                        cache.update(&name, data.clone(), version);
                        data
                    }
                },
                _ => {
                    let mut loaded = files::load_module_data(repo, &name, base_ds)?;
                    if loaded.is_none() && base_ds == Datastore::Candidate {
                        // An unmodified candidate mirrors running.
                        loaded = files::load_module_data(repo, &name, Datastore::Running)?;
                    }
                    loaded.unwrap_or_default()
                }
            };

            if self.ds == Datastore::Operational && oper_opts.contains(GetOperOptions::NO_CONFIG) {
                nodes.clear();
            }
            self.data.extend_module(&name, nodes);

            if self.ds == Datastore::Operational && !oper_opts.contains(GetOperOptions::NO_STORED)
            {
                let stored = files::load_oper_diff(repo, &name)?;
                if !stored.is_empty() {
                    stored.apply(&mut self.data).unwrap_or_else(|e| {
                        tracing::warn!("Stale stored operational data of \"{}\": {}.", name, e);
                    });
                }
            }
            self.mods[i].loaded = true;
        }
        Ok(())
    }
}
