use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use slotstore::{StorageManager, StorageOptions};
use tempfile::TempDir;

fn options(dir: &TempDir) -> StorageOptions {
    StorageOptions::new(dir.path().join("bench"))
}

fn bench_insert_small(c: &mut Criterion) {
    c.bench_function("insert_small_payload", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let sm = StorageManager::open(options(&dir)).unwrap();
                (dir, sm)
            },
            |(_dir, mut sm)| {
                for i in 0..100u32 {
                    sm.insert(format!("payload-{i}").as_bytes()).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_insert_spanning(c: &mut Criterion) {
    let payload = vec![7u8; 9000];
    c.bench_function("insert_spanning_payload", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let sm = StorageManager::open(options(&dir)).unwrap();
                (dir, sm)
            },
            |(_dir, mut sm)| {
                sm.insert(&payload).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_fetch(c: &mut Criterion) {
    c.bench_function("fetch_after_insert", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut sm = StorageManager::open(options(&dir)).unwrap();
                let loc = sm.insert(b"a modest payload for fetch benchmarking").unwrap();
                (dir, sm, loc)
            },
            |(_dir, mut sm, loc)| {
                let mut out = Vec::new();
                sm.fetch(loc, &mut out).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_update_in_place(c: &mut Criterion) {
    c.bench_function("update_in_place", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut sm = StorageManager::open(options(&dir)).unwrap();
                let loc = sm.insert(&vec![0u8; 512]).unwrap();
                (dir, sm, loc)
            },
            |(_dir, mut sm, loc)| {
                sm.update(loc, &vec![1u8; 512]).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_insert_then_free_then_reuse(c: &mut Criterion) {
    c.bench_function("free_list_reuse", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut sm = StorageManager::open(options(&dir)).unwrap();
                let loc = sm.insert(&vec![3u8; 2048]).unwrap();
                sm.free(loc).unwrap();
                sm.flush().unwrap();
                (dir, sm)
            },
            |(_dir, mut sm)| {
                sm.insert(&vec![4u8; 2048]).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_flush(c: &mut Criterion) {
    c.bench_function("flush_after_batch_insert", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut sm = StorageManager::open(options(&dir)).unwrap();
                for i in 0..200u32 {
                    sm.insert(format!("row-{i}").as_bytes()).unwrap();
                }
                (dir, sm)
            },
            |(_dir, mut sm)| {
                sm.flush().unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_insert_small,
    bench_insert_spanning,
    bench_fetch,
    bench_update_in_place,
    bench_insert_then_free_then_reuse,
    bench_flush,
);
criterion_main!(benches);
