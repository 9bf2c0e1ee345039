//! Extension-segment allocator.
//!
//! The ext segment is an append-only heap of 8-byte-aligned blobs: strings
//! and fixed-item arrays referenced by offsets stored in main SHM (or in
//! other ext blobs). Freed or relocated bytes are credited to the `wasted`
//! counter in the ext header and reclaimed by defragmentation.

use crate::layout::ExtShmHeader;
use crate::segment::Shm;
use yds_common::YdsResult;

/// All SHM lengths are aligned up to 8 bytes.
pub const SHM_ALIGN: usize = 8;

/// Align a length up to [`SHM_ALIGN`].
pub fn shm_size(len: usize) -> usize {
    (len + SHM_ALIGN - 1) & !(SHM_ALIGN - 1)
}

/// Aligned SHM footprint of a string (content plus NUL).
pub fn shm_str_size(s: &str) -> usize {
    shm_size(s.len() + 1)
}

/// Wasted-byte count of an ext segment.
pub fn ext_wasted(ext: &Shm) -> usize {
    unsafe { (*ext.at::<ExtShmHeader>(0)).wasted as usize }
}

fn add_wasted(ext: &mut Shm, bytes: usize) {
    unsafe {
        (*ext.at::<ExtShmHeader>(0)).wasted += bytes as u64;
    }
}

/// Reset the wasted counter (defragmentation only).
pub fn reset_wasted(ext: &mut Shm) {
    unsafe {
        (*ext.at::<ExtShmHeader>(0)).wasted = 0;
    }
}

/// Append raw bytes at `end`, zero-padding up to alignment. Returns the
/// offset of the copy and advances `end` by the aligned length.
pub fn shm_cpy(ext: &mut Shm, end: &mut usize, src: &[u8]) -> usize {
    if src.is_empty() {
        return 0;
    }
    let off = *end;
    ext.write_bytes(off, src);
    let aligned = shm_size(src.len());
    if aligned > src.len() {
        ext.write_bytes(off + src.len(), &[0u8; SHM_ALIGN][..aligned - src.len()]);
    }
    *end += aligned;
    off
}

/// Append a NUL-terminated string at `end`. Returns its offset.
pub fn shm_str_cpy(ext: &mut Shm, end: &mut usize, s: &str) -> usize {
    let off = *end;
    ext.write_bytes(off, s.as_bytes());
    let aligned = shm_str_size(s);
    let pad = aligned - s.len();
    ext.write_bytes(off + s.len(), &[0u8; SHM_ALIGN][..pad]);
    *end += aligned;
    off
}

/// Result of [`realloc_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReallocAdd {
    /// Array offset after the insert; may differ from the input when the
    /// array was relocated to the end of the segment.
    pub array_off: usize,
    /// Offset of the inserted (uninitialized) item slot.
    pub item_off: usize,
    /// Offset of the extra dynamic area, `0` when none was requested.
    pub dyn_off: usize,
}

/// Insert one item slot into an ext array of `count` items of `item_size`
/// bytes at `add_idx` (`None` appends), optionally reserving `dyn_size`
/// extra bytes for dynamic attributes of the item.
///
/// When the grown array still fits the old slot's alignment slack (and no
/// dynamic bytes are needed), the insert happens in place by shifting the
/// tail right and the segment does not grow. Otherwise a new array is
/// appended at the end of the segment, surviving items are copied over and
/// the old slot is credited to `wasted`.
///
/// The caller holds the remap-write lock, writes the returned offsets back
/// into the owning record and increments its count afterwards.
pub fn realloc_add(
    ext: &mut Shm,
    array_off: usize,
    count: u16,
    item_size: usize,
    add_idx: Option<u16>,
    dyn_size: usize,
) -> YdsResult<ReallocAdd> {
    let count = count as usize;
    let add_idx = add_idx.map(|i| i as usize).unwrap_or(count);
    debug_assert!(add_idx <= count);

    let old_slot = shm_size(count * item_size);
    let new_slot = shm_size((count + 1) * item_size);

    if new_slot + dyn_size > old_slot {
        // Relocate to the end of the segment.
        let new_array_off = ext.size();
        let dyn_off = new_array_off + new_slot;
        let new_ext_size = dyn_off + dyn_size;
        ext.remap(new_ext_size)?;

        add_wasted(ext, old_slot);

        if add_idx > 0 {
            ext.move_bytes(array_off, new_array_off, add_idx * item_size);
        }
        if add_idx < count {
            ext.move_bytes(
                array_off + add_idx * item_size,
                new_array_off + (add_idx + 1) * item_size,
                (count - add_idx) * item_size,
            );
        }

        Ok(ReallocAdd {
            array_off: new_array_off,
            item_off: new_array_off + add_idx * item_size,
            dyn_off: if dyn_size > 0 { dyn_off } else { 0 },
        })
    } else {
        debug_assert_eq!(dyn_size, 0);
        // The alignment slack covers the new item; shift the tail right.
        if add_idx < count {
            ext.move_bytes(
                array_off + add_idx * item_size,
                array_off + (add_idx + 1) * item_size,
                (count - add_idx) * item_size,
            );
        }
        Ok(ReallocAdd {
            array_off,
            item_off: array_off + add_idx * item_size,
            dyn_off: 0,
        })
    }
}

/// Remove the item at `del_idx` from an ext array, compacting in place and
/// crediting the freed slot bytes plus `dyn_size_freed` to `wasted`.
/// Returns the new array offset: `0` when the array became empty. The
/// caller decrements its count afterwards.
pub fn realloc_del(
    ext: &mut Shm,
    array_off: usize,
    count: u16,
    item_size: usize,
    del_idx: u16,
    dyn_size_freed: usize,
) -> usize {
    let count = count as usize;
    let del_idx = del_idx as usize;
    debug_assert!(del_idx < count);

    let freed = shm_size(count * item_size) - shm_size((count - 1) * item_size);
    add_wasted(ext, freed + dyn_size_freed);

    if count == 1 {
        return 0;
    }
    if del_idx < count - 1 {
        ext.move_bytes(
            array_off + (del_idx + 1) * item_size,
            array_off + del_idx * item_size,
            (count - 1 - del_idx) * item_size,
        );
    }
    array_off
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::EXT_HEADER_SIZE;

    fn ext_shm() -> (tempfile::TempDir, Shm) {
        let tmp = tempfile::tempdir().unwrap();
        let mut shm = Shm::open(&tmp.path().join("ext"), true, None).unwrap();
        shm.remap(EXT_HEADER_SIZE).unwrap();
        reset_wasted(&mut shm);
        (tmp, shm)
    }

    #[test]
    fn test_align() {
        assert_eq!(shm_size(0), 0);
        assert_eq!(shm_size(1), 8);
        assert_eq!(shm_size(8), 8);
        assert_eq!(shm_size(9), 16);
        assert_eq!(shm_str_size("abcdefg"), 8);
        assert_eq!(shm_str_size("abcdefgh"), 16);
    }

    #[test]
    fn test_str_cpy() {
        let (_tmp, mut ext) = ext_shm();
        let mut end = ext.size();
        ext.remap(end + shm_str_size("hello") + shm_str_size("a")).unwrap();
        let off1 = shm_str_cpy(&mut ext, &mut end, "hello");
        let off2 = shm_str_cpy(&mut ext, &mut end, "a");
        assert_eq!(ext.str_at(off1), "hello");
        assert_eq!(ext.str_at(off2), "a");
        assert_eq!(off2 % 8, 0);
    }

    #[test]
    fn test_realloc_add_grows_once_per_slot() {
        let (_tmp, mut ext) = ext_shm();
        // 4-byte items: two fit into one aligned slot.
        let r1 = realloc_add(&mut ext, 0, 0, 4, None, 0).unwrap();
        let size_after_first = ext.size();
        assert_eq!(ext_wasted(&ext), 0);

        // Second insert fits the slack; no growth, no waste.
        let r2 = realloc_add(&mut ext, r1.array_off, 1, 4, None, 0).unwrap();
        assert_eq!(ext.size(), size_after_first);
        assert_eq!(r2.array_off, r1.array_off);
        assert_eq!(ext_wasted(&ext), 0);

        // Third insert must relocate and waste the old slot.
        let r3 = realloc_add(&mut ext, r2.array_off, 2, 4, None, 0).unwrap();
        assert!(ext.size() > size_after_first);
        assert_ne!(r3.array_off, r2.array_off);
        assert_eq!(ext_wasted(&ext), shm_size(2 * 4));
    }

    #[test]
    fn test_realloc_add_preserves_items_and_insert_position() {
        let (_tmp, mut ext) = ext_shm();
        let mut array_off = 0;
        let mut count: u16 = 0;
        for v in [10u64, 20, 30] {
            let r = realloc_add(&mut ext, array_off, count, 8, None, 0).unwrap();
            array_off = r.array_off;
            ext.write_bytes(r.item_off, &v.to_ne_bytes());
            count += 1;
        }
        // Insert 15 at index 1.
        let r = realloc_add(&mut ext, array_off, count, 8, Some(1), 0).unwrap();
        array_off = r.array_off;
        ext.write_bytes(r.item_off, &15u64.to_ne_bytes());
        count += 1;

        let values: Vec<u64> = (0..count as usize)
            .map(|i| {
                let mut b = [0u8; 8];
                b.copy_from_slice(ext.bytes(array_off + i * 8, 8));
                u64::from_ne_bytes(b)
            })
            .collect();
        assert_eq!(values, vec![10, 15, 20, 30]);
    }

    #[test]
    fn test_realloc_del_compacts_and_wastes() {
        let (_tmp, mut ext) = ext_shm();
        let mut array_off = 0;
        let mut count: u16 = 0;
        for v in [1u64, 2, 3] {
            let r = realloc_add(&mut ext, array_off, count, 8, None, 0).unwrap();
            array_off = r.array_off;
            ext.write_bytes(r.item_off, &v.to_ne_bytes());
            count += 1;
        }
        let wasted_before = ext_wasted(&ext);

        array_off = realloc_del(&mut ext, array_off, count, 8, 1, 0);
        count -= 1;
        assert!(array_off != 0);
        assert!(ext_wasted(&ext) > wasted_before);

        let values: Vec<u64> = (0..count as usize)
            .map(|i| {
                let mut b = [0u8; 8];
                b.copy_from_slice(ext.bytes(array_off + i * 8, 8));
                u64::from_ne_bytes(b)
            })
            .collect();
        assert_eq!(values, vec![1, 3]);

        // Deleting the rest empties the array.
        array_off = realloc_del(&mut ext, array_off, count, 8, 1, 0);
        count -= 1;
        assert_ne!(array_off, 0);
        array_off = realloc_del(&mut ext, array_off, count, 8, 0, 0);
        assert_eq!(array_off, 0);
    }

    #[test]
    fn test_realloc_add_with_dyn_area() {
        let (_tmp, mut ext) = ext_shm();
        let r = realloc_add(&mut ext, 0, 0, 16, None, shm_str_size("xpath")).unwrap();
        assert_ne!(r.dyn_off, 0);
        assert_eq!(r.dyn_off, r.array_off + 16);
        let mut end = r.dyn_off;
        let s_off = shm_str_cpy(&mut ext, &mut end, "xpath");
        assert_eq!(ext.str_at(s_off), "xpath");
    }
}
