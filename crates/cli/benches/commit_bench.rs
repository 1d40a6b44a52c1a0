use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::collections::BTreeMap;
use tempfile::tempdir;
use universe::{IndexInfo, Universe, UniverseConfig};

const N_COMMITS: u64 = 1_000;
const NAME: u64 = 1;
const SIZE: u64 = 2;

fn commit_all(store: &Universe) {
    for i in 0..N_COMMITS {
        let mut tx = store.begin();
        let h = tx.create_atom();
        tx.add_junction(h, NAME, format!("atom-{}", i)).unwrap();
        tx.add_junction(h, SIZE, i as i64).unwrap();
        tx.commit().unwrap();
    }
}

fn commit_in_memory(c: &mut Criterion) {
    c.bench_function("commit_in_memory_1k", |b| {
        b.iter_batched(
            || Universe::in_memory(UniverseConfig::default()),
            |store| commit_all(&store),
            BatchSize::SmallInput,
        );
    });
}

fn commit_to_file(c: &mut Criterion) {
    c.bench_function("commit_to_file_no_sync_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let config = UniverseConfig {
                    sync: false,
                    ..UniverseConfig::with_path(dir.path().join("bench.db"))
                };
                let store = Universe::create(config, BTreeMap::new()).unwrap();
                (dir, store)
            },
            |(_dir, store)| commit_all(&store),
            BatchSize::SmallInput,
        );
    });
}

fn index_catch_up(c: &mut Criterion) {
    let store = Universe::in_memory(UniverseConfig::default());
    commit_all(&store);
    let mut n = 0u64;
    c.bench_function("index_catch_up_1k", |b| {
        b.iter(|| {
            n += 1;
            let index = store
                .create_index(IndexInfo::new(format!("by-size-{}", n)).sort_by(SIZE))
                .unwrap();
            assert_eq!(index.len(), N_COMMITS as usize);
        });
    });
}

criterion_group!(benches, commit_in_memory, commit_to_file, index_catch_up);
criterion_main!(benches);
