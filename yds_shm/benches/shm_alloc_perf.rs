//! Ext allocator and segment access benchmarks.

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use yds_common::Repository;
use yds_shm::alloc::{self, shm_str_size};
use yds_shm::layout::EXT_HEADER_SIZE;
use yds_shm::segment::Shm;

fn bench_realloc_add(c: &mut Criterion) {
    c.bench_function("realloc_add_100_items", |b| {
        b.iter_batched(
            || {
                let tmp = tempfile::tempdir().unwrap();
                let repo = Repository::with_root(tmp.path()).unwrap();
                repo.ensure_dirs().unwrap();
                let mut ext = Shm::open(&repo.ext_shm_path(), true, None).unwrap();
                ext.remap(EXT_HEADER_SIZE).unwrap();
                alloc::reset_wasted(&mut ext);
                (tmp, ext)
            },
            |(_tmp, mut ext)| {
                let mut array_off = 0usize;
                for i in 0..100u64 {
                    let r = alloc::realloc_add(&mut ext, array_off, i as u16, 24, None, 0)
                        .unwrap();
                    array_off = r.array_off;
                    ext.write_bytes(r.item_off, &i.to_ne_bytes());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_str_cpy(c: &mut Criterion) {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repository::with_root(tmp.path()).unwrap();
    repo.ensure_dirs().unwrap();
    let mut ext = Shm::open(&repo.ext_shm_path(), true, None).unwrap();
    let payload = "/example-module:server/listen[name='bench']/address";
    ext.remap(EXT_HEADER_SIZE + 10_000 * shm_str_size(payload)).unwrap();
    alloc::reset_wasted(&mut ext);

    let mut end = EXT_HEADER_SIZE;
    c.bench_function("shm_str_cpy", |b| {
        b.iter(|| {
            if end + shm_str_size(payload) > ext.size() {
                end = EXT_HEADER_SIZE;
            }
            alloc::shm_str_cpy(&mut ext, &mut end, payload)
        })
    });
}

criterion_group!(benches, bench_realloc_add, bench_str_cpy);
criterion_main!(benches);
