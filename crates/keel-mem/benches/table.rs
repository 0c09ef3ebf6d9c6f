//! Table benchmarks against hashbrown.
//!
//! Both sides hash keys with fxhash so only the table layout differs.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use fxhash::FxBuildHasher;
use keel_mem::{ArenaConfig, Table};

type FxMap = hashbrown::HashMap<u64, u64, FxBuildHasher>;

fn config() -> ArenaConfig {
    ArenaConfig::new().reserve_size(64 * 1024 * 1024)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("keel", size), &size, |b, &size| {
            b.iter(|| {
                let mut table: Table<u64, u64> = Table::with_config(32, config()).unwrap();
                for k in 0..size {
                    table.add(fxhash::hash64(&k), k, k).unwrap();
                }
                black_box(table.len())
            });
        });

        group.bench_with_input(BenchmarkId::new("hashbrown", size), &size, |b, &size| {
            b.iter(|| {
                let mut map = FxMap::default();
                for k in 0..size {
                    map.insert(k, k);
                }
                black_box(map.len())
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    let size = 10_000u64;

    let mut table: Table<u64, u64> = Table::with_config(32, config()).unwrap();
    let mut map = FxMap::default();
    for k in 0..size {
        table.add(fxhash::hash64(&k), k, k).unwrap();
        map.insert(k, k);
    }

    group.bench_function("keel", |b| {
        b.iter(|| {
            for k in 0..size {
                black_box(table.get(fxhash::hash64(&k), &k));
            }
        });
    });

    group.bench_function("hashbrown", |b| {
        b.iter(|| {
            for k in 0..size {
                black_box(map.get(&k));
            }
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    c.bench_function("add_remove_churn", |b| {
        let mut table: Table<u64, u64> = Table::with_config(1024, config()).unwrap();
        let mut k = 0u64;
        b.iter(|| {
            // Tombstones are only dropped by a rehash, which doubles the
            // capacity; clear before that happens to keep the table small.
            if table.slots_filled() * 10 >= table.capacity() * 6 {
                table.clear();
            }
            let hash = fxhash::hash64(&k);
            table.add(hash, k, k).unwrap();
            black_box(table.remove(hash, &k));
            k += 1;
        });
    });
}

criterion_group!(benches, bench_insert, bench_lookup, bench_churn);
criterion_main!(benches);
