//! Property tests for the ext allocator accounting.

use proptest::prelude::*;
use yds_common::Repository;
use yds_shm::alloc::{self, shm_size, shm_str_size};
use yds_shm::layout::EXT_HEADER_SIZE;
use yds_shm::segment::Shm;

const ITEM_SIZE: usize = 24;

#[derive(Debug, Clone)]
enum Op {
    Add(String),
    Del(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => "[a-z]{1,40}".prop_map(Op::Add),
        1 => (0usize..64).prop_map(Op::Del),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any add/del sequence on one array with dynamic strings, the
    /// segment splits exactly into header + live bytes + wasted bytes +
    /// the append frontier that newer relocations left behind. The key
    /// invariant: wasted is precisely the sum of retired slots and freed
    /// dynamic areas.
    #[test]
    fn prop_wasted_accounting(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let tmp = tempfile::tempdir().unwrap();
        let repo = Repository::with_root(tmp.path()).unwrap();
        repo.ensure_dirs().unwrap();
        let mut ext = Shm::open(&repo.ext_shm_path(), true, None).unwrap();
        ext.remap(EXT_HEADER_SIZE).unwrap();
        alloc::reset_wasted(&mut ext);

        let mut array_off = 0usize;
        let mut live: Vec<String> = Vec::new();
        let mut expected_wasted = 0usize;

        for op in ops {
            match op {
                Op::Add(s) => {
                    let dyn_size = shm_str_size(&s);
                    let old_slot = shm_size(live.len() * ITEM_SIZE);
                    let new_slot = shm_size((live.len() + 1) * ITEM_SIZE);
                    let relocates = new_slot + dyn_size > old_slot;

                    let r = alloc::realloc_add(
                        &mut ext,
                        array_off,
                        live.len() as u16,
                        ITEM_SIZE,
                        None,
                        dyn_size,
                    )
                    .unwrap();
                    if relocates {
                        expected_wasted += old_slot;
                    }
                    array_off = r.array_off;
                    let mut end = r.dyn_off;
                    let str_off = alloc::shm_str_cpy(&mut ext, &mut end, &s) as u64;
                    ext.write_bytes(r.item_off, &str_off.to_ne_bytes());
                    ext.write_bytes(r.item_off + 8, &(s.len() as u64).to_ne_bytes());
                    live.push(s);
                }
                Op::Del(i) => {
                    if live.is_empty() {
                        continue;
                    }
                    let idx = i % live.len();
                    let s = live.remove(idx);
                    let old_slot = shm_size((live.len() + 1) * ITEM_SIZE);
                    let new_slot = shm_size(live.len() * ITEM_SIZE);
                    expected_wasted += (old_slot - new_slot) + shm_str_size(&s);
                    array_off = alloc::realloc_del(
                        &mut ext,
                        array_off,
                        (live.len() + 1) as u16,
                        ITEM_SIZE,
                        idx as u16,
                        shm_str_size(&s),
                    );
                }
            }
        }

        prop_assert_eq!(alloc::ext_wasted(&ext), expected_wasted);
        if live.is_empty() {
            prop_assert_eq!(array_off, 0);
        }

        // Surviving items kept their order and still resolve.
        for (i, s) in live.iter().enumerate() {
            let item_off = array_off + i * ITEM_SIZE;
            let mut off_buf = [0u8; 8];
            off_buf.copy_from_slice(ext.bytes(item_off, 8));
            let str_off = u64::from_ne_bytes(off_buf) as usize;
            prop_assert_eq!(ext.str_at(str_off), s.as_str());
        }
    }
}
