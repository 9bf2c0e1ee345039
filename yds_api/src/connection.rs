//! Connections: SHM bootstrap, scheduled-change application, module
//! registry mutators and teardown.

use parking_lot::Mutex;
use std::sync::Arc;
use yds_common::{Cid, ConnOptions, LockMode, Repository, YdsError, YdsResult};
use yds_data::schema::SchemaModule;
use yds_engine::ModCache;
use yds_engine::store;
use yds_shm::conn::{self, ConnLockfile};
use yds_shm::main_shm::ShmMain;
use yds_shm::manifest::{Manifest, ScheduledChange};
use yds_shm::mod_sub;
use yds_shm::sync;
use yds_sub::recovery::recovery_sweep;

/// Shared state of one connection, owned by every session and
/// subscription created from it.
pub struct ConnInner {
    pub(crate) repo: Repository,
    pub(crate) cid: Cid,
    pub(crate) shm: Mutex<ShmMain>,
    pub(crate) manifest: Manifest,
    pub(crate) cache: Option<ModCache>,
    pub(crate) options: ConnOptions,
    _lockfile: ConnLockfile,
}

/// A connection to one repository. The library has no broker process;
/// connecting maps the coordination segments into this process.
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    /// Connect to the repository resolved from the environment.
    pub fn connect(options: ConnOptions) -> YdsResult<Connection> {
        Self::connect_to(Repository::from_env()?, options)
    }

    /// Connect to an explicit repository.
    pub fn connect_to(repo: Repository, options: ConnOptions) -> YdsResult<Connection> {
        repo.ensure_dirs()?;

        let mut created = false;
        let mut shm = ShmMain::open(&repo, &mut created)?;

        shm.lock_remap(LockMode::Write, LockMode::Write)?;
        let setup = Self::bootstrap(&mut shm, &repo, created, options);
        let (cid, manifest, lockfile) = match setup {
            Ok(v) => v,
            Err(e) => {
                shm.unlock(LockMode::Write, LockMode::Write);
                return Err(e);
            }
        };
        shm.unlock(LockMode::Write, LockMode::Write);

        tracing::info!("Connection {} established.", cid);
        let cache = options
            .contains(ConnOptions::CACHE_RUNNING)
            .then(ModCache::new);
        Ok(Connection {
            inner: Arc::new(ConnInner {
                repo,
                cid,
                shm: Mutex::new(shm),
                manifest,
                cache,
                options,
                _lockfile: lockfile,
            }),
        })
    }

    fn bootstrap(
        shm: &mut ShmMain,
        repo: &Repository,
        created: bool,
        options: ConnOptions,
    ) -> YdsResult<(Cid, Manifest, ConnLockfile)> {
        if let Err(e) = recovery_sweep(shm, repo) {
            tracing::warn!("Connection recovery failed: {}.", e);
        }

        // The whole load-apply-store sequence runs under the manifest lock
        // so module mutators in other processes cannot interleave.
        let lock =
            unsafe { &raw mut (*shm.main.at::<yds_shm::layout::MainShmHeader>(0)).manifest_lock };
        unsafe {
            sync::rwlock_lock(lock, sync::MAIN_LOCK_TIMEOUT_MS, LockMode::Write, "manifest")?;
        }
        let res = (|| {
            let mut manifest = Manifest::load(repo)?;

            // Scheduled module changes apply once nothing holds the old
            // SHM content.
            let no_connections = conn::live_conn_count(shm, repo) == 0;
            if created || (no_connections && !manifest.scheduled.is_empty()) {
                let before: Vec<String> =
                    manifest.modules.iter().map(|m| m.schema.name.clone()).collect();
                let (changed, errors) = manifest.apply_scheduled();
                if options.contains(ConnOptions::ERR_ON_SCHED_FAIL) {
                    if let Some(err) = errors.into_iter().next() {
                        return Err(err);
                    }
                }
                if changed || created {
                    manifest.store(repo)?;
                    shm.rebuild(&manifest.module_inits())?;
                    for name in before.iter().filter(|n| manifest.schema(n).is_none()) {
                        yds_data::files::remove_module_files(repo, name);
                    }
                    for module in &manifest.modules {
                        store::seed_module_files(repo, &manifest, &module.schema.name)?;
                    }
                    store::startup_to_running(repo, &manifest, created)?;
                }
            }
            Ok(manifest)
        })();
        // A rebuild may have remapped main SHM; the lock state lives in
        // the file pages, so re-derive its address before unlocking.
        let lock =
            unsafe { &raw mut (*shm.main.at::<yds_shm::layout::MainShmHeader>(0)).manifest_lock };
        unsafe {
            sync::rwlock_unlock(lock, LockMode::Write);
        }
        let manifest = res?;

        let cid = shm.new_cid();
        let lockfile = ConnLockfile::create(repo, cid)?;
        conn::conn_add(shm, cid, std::process::id() as i32)?;
        Ok((cid, manifest, lockfile))
    }

    fn with_manifest_write<T>(
        &self,
        f: impl FnOnce(&mut Manifest) -> YdsResult<T>,
    ) -> YdsResult<T> {
        let shm = self.inner.shm.lock();
        let lock = unsafe { &raw mut (*shm.main.at::<yds_shm::layout::MainShmHeader>(0)).manifest_lock };
        unsafe {
            sync::rwlock_lock(lock, sync::MAIN_LOCK_TIMEOUT_MS, LockMode::Write, "manifest")?;
        }
        let res = (|| {
            let mut manifest = Manifest::load(&self.inner.repo)?;
            let out = f(&mut manifest)?;
            manifest.store(&self.inner.repo)?;
            Ok(out)
        })();
        unsafe {
            sync::rwlock_unlock(lock, LockMode::Write);
        }
        res
    }

    /// Repository of this connection.
    pub fn repository(&self) -> &Repository {
        &self.inner.repo
    }

    /// Connection ID.
    pub fn cid(&self) -> Cid {
        self.inner.cid
    }

    /// Connection options.
    pub fn options(&self) -> ConnOptions {
        self.inner.options
    }

    /// Installed module schema.
    pub fn get_module(&self, name: &str) -> Option<&SchemaModule> {
        self.inner.manifest.schema(name)
    }

    /// Schedule a module installation, applied by the next connect that
    /// finds no live connections.
    pub fn install_module(&self, schema: SchemaModule) -> YdsResult<()> {
        self.with_manifest_write(|m| m.schedule(ScheduledChange::Install { schema }))
    }

    /// Schedule a module removal.
    pub fn remove_module(&self, name: &str) -> YdsResult<()> {
        self.with_manifest_write(|m| {
            m.schedule(ScheduledChange::Remove {
                name: name.to_string(),
            })
        })
    }

    /// Schedule a module schema update.
    pub fn update_module(&self, schema: SchemaModule) -> YdsResult<()> {
        self.with_manifest_write(|m| m.schedule(ScheduledChange::Update { schema }))
    }

    /// Schedule enabling or disabling a feature.
    pub fn change_feature(&self, module: &str, feature: &str, enable: bool) -> YdsResult<()> {
        self.with_manifest_write(|m| {
            m.schedule(ScheduledChange::ChangeFeature {
                module: module.to_string(),
                feature: feature.to_string(),
                enable,
            })
        })
    }

    /// Change notification replay support of a module. Takes effect
    /// immediately; no structural SHM change is needed.
    pub fn set_replay_support(&self, module: &str, enable: bool) -> YdsResult<()> {
        self.with_manifest_write(|m| {
            let entry = m
                .modules
                .iter_mut()
                .find(|mm| mm.schema.name == module)
                .ok_or_else(|| YdsError::NotFound {
                    msg: format!("Module \"{}\".", module),
                })?;
            entry.replay_support = enable;
            Ok(())
        })?;

        let mut shm = self.inner.shm.lock();
        shm.lock_remap(LockMode::Write, LockMode::Read)?;
        let res = mod_sub::replay_support_update(&mut shm, Some(module), enable);
        shm.unlock(LockMode::Write, LockMode::Read);
        res
    }

    /// Suspend or resume a notification subscription by its id.
    pub fn set_notif_suspended(
        &self,
        module: &str,
        sub_id: u32,
        suspend: bool,
    ) -> YdsResult<()> {
        let mut shm = self.inner.shm.lock();
        shm.lock_remap(LockMode::Write, LockMode::Read)?;
        let res = (|| {
            let idx = shm.find_module(module).ok_or_else(|| YdsError::NotFound {
                msg: format!("Module \"{}\".", module),
            })?;
            mod_sub::notif_sub_suspend(&mut shm, idx, sub_id, suspend)
        })();
        shm.unlock(LockMode::Write, LockMode::Read);
        res
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let shm = self.shm.get_mut();
        if shm.lock_remap(LockMode::Write, LockMode::Write).is_ok() {
            if let Err(e) = recovery_sweep(shm, &self.repo) {
                tracing::warn!("Disconnect recovery failed: {}.", e);
            }
            if let Err(e) = conn::conn_del(shm, self.cid) {
                tracing::debug!("Connection {} record already gone: {}.", self.cid, e);
            }
            shm.unlock(LockMode::Write, LockMode::Write);
        }
        tracing::info!("Connection {} closed.", self.cid);
    }
}
