//! Per-subscription-context event pipes.
//!
//! Each subscription context owns one FIFO; event originators write a
//! token into it to wake the context's listener, which drains the pipe and
//! scans its slots.

use nix::sys::stat::Mode;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use yds_common::{Repository, YdsError, YdsResult};

/// Token written to wake a listener.
pub const TOKEN_EVENT: u8 = b'e';
/// Token asking the listener to shut down.
pub const TOKEN_STOP: u8 = b'q';

/// Create the FIFO for `evpipe_num`, replacing a stale one left behind by
/// an earlier repository generation.
pub fn create(repo: &Repository, evpipe_num: u32) -> YdsResult<()> {
    let path = repo.evpipe_path(evpipe_num);
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| YdsError::from_errno(path.display().to_string(), e))
}

/// Open the reading end, nonblocking so `open` does not wait for writers.
pub fn open_read(repo: &Repository, evpipe_num: u32) -> YdsResult<File> {
    let path = repo.evpipe_path(evpipe_num);
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .map_err(|e| YdsError::from_io(path.display().to_string(), e))
}

/// Write a token into the pipe of `evpipe_num`. A missing or readerless
/// pipe is not an error; the subscriber is gone and the caller's timeout
/// or the recovery sweep handles it.
pub fn notify(repo: &Repository, evpipe_num: u32, token: u8) -> YdsResult<()> {
    let path = repo.evpipe_path(evpipe_num);
    let file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path);
    let mut file = match file {
        Ok(f) => f,
        Err(e)
            if e.raw_os_error() == Some(libc::ENXIO)
                || e.kind() == std::io::ErrorKind::NotFound =>
        {
            tracing::debug!("Event pipe {} has no listener.", evpipe_num);
            return Ok(());
        }
        Err(e) => return Err(YdsError::from_io(path.display().to_string(), e)),
    };
    match file.write_all(&[token]) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(YdsError::from_io(path.display().to_string(), e)),
    }
}

/// Drain all pending tokens; returns whether a stop token was seen.
pub fn drain(pipe: &mut File) -> bool {
    let mut stop = false;
    let mut buf = [0u8; 64];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if buf[..n].contains(&TOKEN_STOP) {
                    stop = true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
    stop
}

/// Remove the FIFO of `evpipe_num`.
pub fn unlink(repo: &Repository, evpipe_num: u32) {
    let path = repo.evpipe_path(evpipe_num);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to unlink \"{}\" ({}).", path.display(), e);
        }
    }
}
