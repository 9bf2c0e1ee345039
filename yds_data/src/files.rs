//! Per-module datastore files.
//!
//! Each module's datastore is one binary-encoded tree file under the data
//! directory; stored operational edits live in the `.operational` file as
//! a diff with origin tags. Files are replaced by truncate-and-write while
//! the caller holds the module's data write lock, and synced before the
//! lock is released.

use crate::diff::DiffTree;
use crate::lyb;
use crate::tree::DataNode;
use std::io::Write;
use yds_common::{Datastore, Repository, YdsError, YdsResult};

/// Load one module's data for a datastore. `None` when the file does not
/// exist (an absent candidate falls back to running at a higher level).
pub fn load_module_data(
    repo: &Repository,
    module: &str,
    ds: Datastore,
) -> YdsResult<Option<Vec<DataNode>>> {
    let path = repo.data_path(module, ds);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(YdsError::from_io(path.display().to_string(), e)),
    };
    if bytes.is_empty() {
        return Ok(Some(Vec::new()));
    }
    lyb::decode_data(&bytes).map(Some)
}

/// Write one module's data file and sync it to disk.
pub fn store_module_data(
    repo: &Repository,
    module: &str,
    ds: Datastore,
    nodes: &[DataNode],
) -> YdsResult<()> {
    let path = repo.data_path(module, ds);
    let bytes = lyb::encode_data(nodes)?;
    let mut file = std::fs::File::create(&path)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    file.write_all(&bytes)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    file.sync_all()
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    Ok(())
}

/// Load the stored operational diff of one module; empty when absent.
pub fn load_oper_diff(repo: &Repository, module: &str) -> YdsResult<DiffTree> {
    let path = repo.data_path(module, Datastore::Operational);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DiffTree::new()),
        Err(e) => return Err(YdsError::from_io(path.display().to_string(), e)),
    };
    if bytes.is_empty() {
        return Ok(DiffTree::new());
    }
    lyb::decode_diff(&bytes)
}

/// Write the stored operational diff of one module.
pub fn store_oper_diff(repo: &Repository, module: &str, diff: &DiffTree) -> YdsResult<()> {
    let path = repo.data_path(module, Datastore::Operational);
    let bytes = lyb::encode_diff(diff)?;
    let mut file = std::fs::File::create(&path)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    file.write_all(&bytes)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    file.sync_all()
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    Ok(())
}

/// Remove the candidate file of a module, resetting it to mirror running.
pub fn remove_candidate(repo: &Repository, module: &str) -> YdsResult<()> {
    let path = repo.data_path(module, Datastore::Candidate);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            tracing::warn!("Failed to unlink \"{}\" ({}).", path.display(), e);
            Ok(())
        }
    }
}

/// Remove every data file of a module (uninstall).
pub fn remove_module_files(repo: &Repository, module: &str) {
    for ds in Datastore::ALL {
        let path = repo.data_path(module, ds);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to unlink \"{}\" ({}).", path.display(), e);
            }
        }
    }
}
