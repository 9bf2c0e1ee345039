//! Memory-mapped segment files.
//!
//! A [`Shm`] wraps one file mapped read/write shared. All cross-structure
//! references inside a segment are byte offsets from its start; raw
//! addresses never leave the process, and any address obtained from a
//! mapping is only valid until the next [`Shm::remap`].

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use yds_common::{YdsError, YdsResult};

/// One mapped segment file.
pub struct Shm {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    size: usize,
}

impl Shm {
    /// Open (and create if allowed) a segment file. An empty file stays
    /// unmapped until the first [`Shm::remap`]. Sets `created` when the
    /// file did not exist before.
    pub fn open(path: &Path, create: bool, created: Option<&mut bool>) -> YdsResult<Shm> {
        let existed = path.exists();
        if !existed && !create {
            return Err(YdsError::NotFound {
                msg: format!("Shared memory file \"{}\".", path.display()),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .mode(0o600)
            .open(path)
            .map_err(|e| YdsError::from_io(path.display().to_string(), e))?;
        if let Some(created) = created {
            *created = !existed;
        }

        let mut shm = Shm {
            path: path.to_path_buf(),
            file,
            map: None,
            size: 0,
        };
        if shm.file_size()? > 0 {
            shm.remap(0)?;
        }
        Ok(shm)
    }

    /// Segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Currently mapped size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current file size.
    pub fn file_size(&self) -> YdsResult<u64> {
        let meta = self
            .file
            .metadata()
            .map_err(|e| YdsError::from_io(self.path.display().to_string(), e))?;
        Ok(meta.len())
    }

    /// Remap the segment to `new_size` bytes; `0` means "the current file
    /// size". No-op when the mapping already has the target size. The
    /// caller must guarantee no address into this mapping is in use.
    pub fn remap(&mut self, new_size: usize) -> YdsResult<()> {
        let target = if new_size == 0 {
            self.file_size()? as usize
        } else {
            new_size
        };
        if target == self.size && self.map.is_some() {
            return Ok(());
        }

        self.map = None;

        if new_size != 0 {
            self.file
                .set_len(new_size as u64)
                .map_err(|e| YdsError::from_io(self.path.display().to_string(), e))?;
        }
        self.size = target;
        if target == 0 {
            return Ok(());
        }

        let map = unsafe { MmapOptions::new().len(target).map_mut(&self.file) }.map_err(|e| {
            YdsError::NoMem {
                msg: format!("Failed to map \"{}\": {}.", self.path.display(), e),
            }
        })?;
        self.map = Some(map);
        Ok(())
    }

    /// Base address of the mapping.
    pub fn addr(&self) -> *const u8 {
        self.map
            .as_ref()
            .map(|m| m.as_ptr())
            .unwrap_or(std::ptr::null())
    }

    /// Mutable base address of the mapping.
    pub fn addr_mut(&mut self) -> *mut u8 {
        self.map
            .as_mut()
            .map(|m| m.as_mut_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    /// Typed pointer at a byte offset.
    ///
    /// # Safety
    /// The offset must be within the mapping, 8-byte aligned, and the
    /// pointer must not outlive the current mapping.
    pub unsafe fn at<T>(&self, off: usize) -> *mut T {
        debug_assert!(off + size_of::<T>() <= self.size);
        debug_assert_eq!(off % 8, 0);
        unsafe { self.addr().add(off) as *mut T }
    }

    /// Typed slice at a byte offset.
    ///
    /// # Safety
    /// The range must be within the mapping and properly aligned for `T`,
    /// and the slice must not outlive the current mapping.
    pub unsafe fn slice_at<T>(&self, off: usize, count: usize) -> &[T] {
        debug_assert!(off + count * size_of::<T>() <= self.size);
        unsafe { std::slice::from_raw_parts(self.addr().add(off) as *const T, count) }
    }

    /// Byte slice at an offset.
    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.addr().add(off), len) }
    }

    /// Write bytes at an offset.
    pub fn write_bytes(&mut self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr_mut().add(off), data.len());
        }
    }

    /// NUL-terminated string at an offset. Offset `0` yields "".
    pub fn str_at(&self, off: usize) -> &str {
        if off == 0 {
            return "";
        }
        let bytes = self.bytes(off, self.size - off);
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(0);
        std::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    /// Move `len` bytes inside the mapping; ranges may overlap.
    pub fn move_bytes(&mut self, src_off: usize, dst_off: usize, len: usize) {
        assert!(src_off + len <= self.size && dst_off + len <= self.size);
        unsafe {
            std::ptr::copy(
                self.addr().add(src_off),
                self.addr_mut().add(dst_off),
                len,
            );
        }
    }

    /// Unmap and close, leaving the file in place.
    pub fn clear(&mut self) {
        self.map = None;
        self.size = 0;
    }
}

impl std::fmt::Debug for Shm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shm")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_create_and_remap() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seg");
        let mut created = false;
        let mut shm = Shm::open(&path, true, Some(&mut created)).unwrap();
        assert!(created);
        assert_eq!(shm.size(), 0);

        shm.remap(4096).unwrap();
        assert_eq!(shm.size(), 4096);
        assert_eq!(shm.file_size().unwrap(), 4096);

        shm.write_bytes(8, b"hello\0");
        assert_eq!(shm.str_at(8), "hello");

        // Growth preserves contents.
        shm.remap(8192).unwrap();
        assert_eq!(shm.str_at(8), "hello");
    }

    #[test]
    fn test_open_missing_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("absent");
        assert!(matches!(
            Shm::open(&path, false, None),
            Err(YdsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_second_mapping_sees_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seg");
        let mut a = Shm::open(&path, true, None).unwrap();
        a.remap(4096).unwrap();
        a.write_bytes(0, &42u64.to_ne_bytes());

        let b = Shm::open(&path, false, None).unwrap();
        assert_eq!(b.size(), 4096);
        assert_eq!(&b.bytes(0, 8)[..], &42u64.to_ne_bytes());
    }

    #[test]
    fn test_move_bytes_overlapping() {
        let tmp = tempfile::tempdir().unwrap();
        let mut shm = Shm::open(&tmp.path().join("seg"), true, None).unwrap();
        shm.remap(4096).unwrap();
        shm.write_bytes(0, b"abcdef");
        shm.move_bytes(0, 2, 6);
        assert_eq!(shm.bytes(2, 6), b"abcdef");
    }
}
