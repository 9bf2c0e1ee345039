//! Per-module notification logs used for replay.
//!
//! Notifications of replay-enabled modules are appended to rolling files
//! named `<mod>.notif.<from>-<to>` where the suffix is the covered
//! timestamp range. A file rolls over once it exceeds the size limit; the
//! range in the name lets replay skip files without opening them.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use yds_common::{Repository, YdsError, YdsResult};
use yds_data::tree::DataNode;

/// Roll the active log file beyond this size.
const NOTIF_FILE_MAX_SIZE: u64 = 1024 * 1024;

/// One logged notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedNotif {
    /// Timestamp, seconds since the epoch.
    pub timestamp: u64,
    /// Notification tree.
    pub notif: DataNode,
}

/// Seconds since the epoch.
pub fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn log_files(repo: &Repository, module: &str) -> YdsResult<Vec<(u64, u64, std::path::PathBuf)>> {
    let dir = repo.notif_dir();
    let prefix = format!("{}.notif.", module);
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(YdsError::from_io(dir.display().to_string(), e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(range) = name.strip_prefix(&prefix) else { continue };
        let Some((from, to)) = range.split_once('-') else { continue };
        if let (Ok(from), Ok(to)) = (from.parse(), to.parse()) {
            out.push((from, to, entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Append one notification to the module's log, rolling the file on size.
pub fn append(repo: &Repository, module: &str, timestamp: u64, notif: &DataNode) -> YdsResult<()> {
    let record = bincode::serialize(&LoggedNotif {
        timestamp,
        notif: notif.clone(),
    })
    .map_err(|e| YdsError::Internal {
        msg: format!("Failed to encode notification: {}.", e),
    })?;

    let files = log_files(repo, module)?;
    let active = files
        .last()
        .filter(|(_, _, path)| {
            std::fs::metadata(path)
                .map(|m| m.len() < NOTIF_FILE_MAX_SIZE)
                .unwrap_or(false)
        })
        .cloned();

    let (from, path) = match active {
        Some((from, _, path)) => (from, path),
        None => {
            let path = repo.notif_log_path(module, timestamp, timestamp);
            (timestamp, path)
        }
    };

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    file.write_all(&(record.len() as u32).to_ne_bytes())
        .and_then(|_| file.write_all(&record))
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
    drop(file);

    // Extend the covered range in the file name.
    let renamed = repo.notif_log_path(module, from, timestamp);
    if renamed != path {
        std::fs::rename(&path, &renamed)
            .map_err(|e| YdsError::from_io(renamed.display().to_string(), e))?;
    }
    Ok(())
}

/// Read every logged notification with `start <= timestamp` (and up to
/// `stop` when given), in order.
pub fn replay(
    repo: &Repository,
    module: &str,
    start: u64,
    stop: Option<u64>,
) -> YdsResult<Vec<LoggedNotif>> {
    let mut out = Vec::new();
    for (from, to, path) in log_files(repo, module)? {
        if to < start || stop.is_some_and(|s| from > s) {
            continue;
        }
        let mut bytes = Vec::new();
        std::fs::File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;

        let mut pos = 0;
        while pos + 4 <= bytes.len() {
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&bytes[pos..pos + 4]);
            let len = u32::from_ne_bytes(len_buf) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                tracing::warn!("Truncated notification log \"{}\".", path.display());
                break;
            }
            let rec: LoggedNotif =
                bincode::deserialize(&bytes[pos..pos + len]).map_err(|e| YdsError::Internal {
                    msg: format!("Corrupted notification log \"{}\": {}.", path.display(), e),
                })?;
            pos += len;
            if rec.timestamp >= start && stop.is_none_or(|s| rec.timestamp <= s) {
                out.push(rec);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, Repository) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        repo.ensure_dirs().unwrap();
        (tmp, repo)
    }

    fn notif(name: &str) -> DataNode {
        DataNode::new(name)
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let (_tmp, repo) = repo();
        append(&repo, "m", 100, &notif("a")).unwrap();
        append(&repo, "m", 200, &notif("b")).unwrap();
        append(&repo, "m", 300, &notif("c")).unwrap();

        let all = replay(&repo, "m", 0, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, 100);
        assert_eq!(all[2].notif.name, "c");

        let late = replay(&repo, "m", 200, None).unwrap();
        assert_eq!(late.len(), 2);

        let window = replay(&repo, "m", 150, Some(250)).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].notif.name, "b");
    }

    #[test]
    fn test_file_name_tracks_range() {
        let (_tmp, repo) = repo();
        append(&repo, "m", 100, &notif("a")).unwrap();
        append(&repo, "m", 250, &notif("b")).unwrap();
        let files = log_files(&repo, "m").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!((files[0].0, files[0].1), (100, 250));
    }

    #[test]
    fn test_modules_do_not_mix() {
        let (_tmp, repo) = repo();
        append(&repo, "m", 100, &notif("a")).unwrap();
        append(&repo, "n", 100, &notif("z")).unwrap();
        let m = replay(&repo, "m", 0, None).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].notif.name, "a");
    }
}
