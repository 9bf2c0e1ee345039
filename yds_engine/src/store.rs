//! Commit-side persistence: per-module file replacement, version bumps,
//! cache refresh and datastore seeding.

use crate::cache::ModCache;
use crate::modinfo::ModInfo;
use yds_common::{Cid, Datastore, Repository, YdsResult};
use yds_data::files;
use yds_shm::main_shm::ShmMain;
use yds_shm::manifest::Manifest;

/// Persist every changed module of `mod_info` while its data write locks
/// are held: write the data file, bump the module version, refresh the
/// cache. Operational commits merge the diff into the stored operational
/// file instead, tagging each node with the writing connection.
pub fn store_changed(
    shm: &mut ShmMain,
    repo: &Repository,
    mod_info: &ModInfo,
    cache: Option<&ModCache>,
    cid: Cid,
) -> YdsResult<()> {
    for m in mod_info.mods.iter().filter(|m| m.changed) {
        if mod_info.ds == Datastore::Operational {
            let mut stored = files::load_oper_diff(repo, &m.name)?;
            stored.merge(&mod_info.diff.split_module(&m.name), Some(cid));
            files::store_oper_diff(repo, &m.name, &stored)?;
        } else {
            let nodes = mod_info.data.module_data(&m.name);
            files::store_module_data(repo, &m.name, mod_info.ds, nodes)?;
        }

        let module = shm.module_mut(m.idx);
        module.ver += 1;
        let version = module.ver;
        tracing::debug!("Module \"{}\" committed, version {}.", m.name, version);

        if let Some(cache) = cache {
            if mod_info.ds == Datastore::Running {
                cache.update(&m.name, mod_info.data.module_data(&m.name).to_vec(), version);
            }
        }
    }
    Ok(())
}

/// Seed missing running files from startup; runs right after the SHM was
/// (re)created.
pub fn startup_to_running(repo: &Repository, manifest: &Manifest, replace: bool) -> YdsResult<()> {
    for module in &manifest.modules {
        let name = &module.schema.name;
        let running_exists = repo.data_path(name, Datastore::Running).exists();
        if running_exists && !replace {
            continue;
        }
        let startup =
            files::load_module_data(repo, name, Datastore::Startup)?.unwrap_or_default();
        files::store_module_data(repo, name, Datastore::Running, &startup)?;
    }
    Ok(())
}

/// Seed the startup file of a freshly installed module with its schema
/// defaults.
pub fn seed_module_files(repo: &Repository, manifest: &Manifest, name: &str) -> YdsResult<()> {
    if repo.data_path(name, Datastore::Startup).exists() {
        return Ok(());
    }
    let Some(schema) = manifest.schema(name) else {
        return Ok(());
    };
    let mut nodes = Vec::new();
    schema.add_defaults(&mut nodes, None);
    files::store_module_data(repo, name, Datastore::Startup, &nodes)?;
    files::store_module_data(repo, name, Datastore::Running, &nodes)?;
    Ok(())
}

/// Drop the candidate files of every required module, resetting candidate
/// to mirror running.
pub fn candidate_reset(repo: &Repository, mod_info: &ModInfo) -> YdsResult<()> {
    for m in &mod_info.mods {
        files::remove_candidate(repo, &m.name)?;
    }
    Ok(())
}
