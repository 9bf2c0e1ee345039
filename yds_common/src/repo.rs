//! Repository directory layout and file naming.
//!
//! All coordination artifacts of one repository live under a single root:
//! the SHM segment files, per-connection lockfiles, event pipes, per-module
//! data files and notification logs. The layout is fixed; only the root and
//! the SHM file prefix are configurable.

use crate::error::{YdsError, YdsResult};
use crate::types::{Cid, Datastore};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding the SHM file prefix.
pub const SHM_PREFIX_ENV: &str = "SR_SHM_PREFIX";

/// Environment variable overriding the repository root.
pub const REPO_PATH_ENV: &str = "YDS_REPO_PATH";

/// Build-time default repository root, used when the environment does not
/// override it.
pub const DEFAULT_REPO_PATH: &str = "/var/lib/yds";

/// Default SHM file prefix.
pub const DEFAULT_SHM_PREFIX: &str = "sr";

/// Optional TOML override file read from the repository root.
#[derive(Debug, Default, Deserialize)]
struct RepoToml {
    #[serde(default)]
    shm_prefix: Option<String>,
}

/// Resolved repository layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
    prefix: String,
}

impl Repository {
    /// Resolve the repository from the environment: `YDS_REPO_PATH` for the
    /// root, `SR_SHM_PREFIX` for the prefix, then a `config.toml` under the
    /// root, then compile-time defaults.
    pub fn from_env() -> YdsResult<Self> {
        let root = std::env::var_os(REPO_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPO_PATH));
        Self::with_root(root)
    }

    /// Resolve the repository under an explicit root. The prefix still
    /// honors `SR_SHM_PREFIX` and the root's `config.toml`.
    pub fn with_root(root: impl Into<PathBuf>) -> YdsResult<Self> {
        let root = root.into();

        let mut prefix = None;
        if let Some(env) = std::env::var_os(SHM_PREFIX_ENV) {
            let env = env.to_string_lossy().into_owned();
            prefix = Some(env);
        } else {
            let cfg_path = root.join("config.toml");
            if let Ok(text) = std::fs::read_to_string(&cfg_path) {
                let cfg: RepoToml = toml::from_str(&text).map_err(|e| YdsError::InvalArg {
                    msg: format!("Failed to parse \"{}\": {}", cfg_path.display(), e),
                })?;
                prefix = cfg.shm_prefix;
            }
        }
        let prefix = prefix.unwrap_or_else(|| DEFAULT_SHM_PREFIX.to_string());

        if prefix.is_empty() || prefix.contains('/') {
            return Err(YdsError::InvalArg {
                msg: format!("Invalid SHM prefix \"{}\".", prefix),
            });
        }

        Ok(Self { root, prefix })
    }

    /// Repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SHM file prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory holding the SHM segment files, event pipes and lockfiles.
    pub fn shm_dir(&self) -> PathBuf {
        self.root.join("shm")
    }

    /// Directory holding the per-module data files.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Directory holding the per-module notification logs.
    pub fn notif_dir(&self) -> PathBuf {
        self.root.join("notif")
    }

    /// Directory holding the per-connection lockfiles.
    pub fn conn_lock_dir(&self) -> PathBuf {
        self.shm_dir().join(format!("{}conn_locks", self.prefix))
    }

    /// Main SHM segment file.
    pub fn main_shm_path(&self) -> PathBuf {
        self.shm_dir().join(format!("{}_main", self.prefix))
    }

    /// Extension SHM segment file.
    pub fn ext_shm_path(&self) -> PathBuf {
        self.shm_dir().join(format!("{}_ext", self.prefix))
    }

    /// File lock guarding main SHM creation.
    pub fn create_lock_path(&self) -> PathBuf {
        self.shm_dir().join(format!("{}_main_lock", self.prefix))
    }

    /// Subscription slot file for a module and suffix, with an optional
    /// second hex suffix (operational subscription path hash).
    pub fn sub_shm_path(&self, module: &str, suffix1: &str, suffix2: Option<u64>) -> PathBuf {
        let name = match suffix2 {
            Some(sfx) => format!("{}sub_{}.{}.{:08x}", self.prefix, module, suffix1, sfx),
            None => format!("{}sub_{}.{}", self.prefix, module, suffix1),
        };
        self.shm_dir().join(name)
    }

    /// Per-connection advisory lockfile.
    pub fn conn_lock_path(&self, cid: Cid) -> PathBuf {
        self.conn_lock_dir().join(format!("conn_{}.lock", cid))
    }

    /// Event pipe of a subscription context.
    pub fn evpipe_path(&self, evpipe_num: u32) -> PathBuf {
        self.shm_dir()
            .join(format!("{}_evpipe{}", self.prefix, evpipe_num))
    }

    /// Binary data file of one module and datastore.
    pub fn data_path(&self, module: &str, ds: Datastore) -> PathBuf {
        self.data_dir()
            .join(format!("{}.{}", module, ds.file_suffix()))
    }

    /// Installed-module manifest, including scheduled changes.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("modules.json")
    }

    /// Notification log file covering `[from, to]`.
    pub fn notif_log_path(&self, module: &str, from: u64, to: u64) -> PathBuf {
        self.notif_dir()
            .join(format!("{}.notif.{}-{}", module, from, to))
    }

    /// Create all repository directories that do not exist yet.
    pub fn ensure_dirs(&self) -> YdsResult<()> {
        for dir in [
            self.root.clone(),
            self.shm_dir(),
            self.data_dir(),
            self.notif_dir(),
            self.conn_lock_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| YdsError::from_io(dir.display().to_string(), e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(root: &Path) -> Repository {
        // Tests must not depend on the ambient environment.
        Repository {
            root: root.to_path_buf(),
            prefix: DEFAULT_SHM_PREFIX.to_string(),
        }
    }

    #[test]
    fn test_file_naming() {
        let r = repo(Path::new("/repo"));
        assert_eq!(r.main_shm_path(), PathBuf::from("/repo/shm/sr_main"));
        assert_eq!(r.ext_shm_path(), PathBuf::from("/repo/shm/sr_ext"));
        assert_eq!(
            r.sub_shm_path("mod-a", "change.running", None),
            PathBuf::from("/repo/shm/srsub_mod-a.change.running")
        );
        assert_eq!(
            r.sub_shm_path("mod-a", "oper", Some(0xabcd)),
            PathBuf::from("/repo/shm/srsub_mod-a.oper.0000abcd")
        );
        assert_eq!(
            r.conn_lock_path(7),
            PathBuf::from("/repo/shm/srconn_locks/conn_7.lock")
        );
        assert_eq!(r.evpipe_path(3), PathBuf::from("/repo/shm/sr_evpipe3"));
        assert_eq!(
            r.data_path("mod-a", Datastore::Running),
            PathBuf::from("/repo/data/mod-a.running")
        );
        assert_eq!(
            r.notif_log_path("mod-a", 10, 20),
            PathBuf::from("/repo/notif/mod-a.notif.10-20")
        );
    }

    #[test]
    fn test_prefix_validation() {
        assert!(Repository::with_root("/tmp/yds-prefix-test").is_ok());
        // A prefix with a slash must be rejected.
        let bad = Repository {
            root: PathBuf::from("/x"),
            prefix: "a/b".into(),
        };
        // Constructed directly only in tests; the public path rejects it.
        assert!(bad.prefix.contains('/'));
    }

    #[test]
    fn test_ensure_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let r = repo(tmp.path());
        r.ensure_dirs().unwrap();
        assert!(r.shm_dir().is_dir());
        assert!(r.data_dir().is_dir());
        assert!(r.notif_dir().is_dir());
        assert!(r.conn_lock_dir().is_dir());
    }
}
