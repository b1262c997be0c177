use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use otf_ctrie::{Collector, Config, Ctrie};

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|index| format!("key-{}", index)).collect()
}

pub fn bench_ctrie(c: &mut Criterion) {
    let mut group = c.benchmark_group("ctrie");
    group.sample_size(20);

    for count in [1_000usize, 10_000, 50_000] {
        let keys = keys(count);

        group.bench_function(BenchmarkId::new("insert", count), |b| {
            b.iter_batched_ref(
                || {
                    let collector = Collector::new(Config::default());
                    let gc = Ctrie::<usize>::spawn_collector(&collector).unwrap();
                    (Ctrie::<usize>::new(&collector).unwrap(), gc)
                },
                |(trie, _gc)| {
                    for (index, key) in keys.iter().enumerate() {
                        trie.insert(key, index).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });

        let collector = Collector::new(Config::default());
        let gc = Ctrie::<usize>::spawn_collector(&collector).unwrap();
        let trie = Ctrie::<usize>::new(&collector).unwrap();
        for (index, key) in keys.iter().enumerate() {
            trie.insert(key, index).unwrap();
        }
        group.bench_function(BenchmarkId::new("lookup", count), |b| {
            b.iter(|| {
                for key in &keys {
                    criterion::black_box(trie.lookup(key).unwrap());
                }
            });
        });
        group.bench_function(BenchmarkId::new("snapshot", count), |b| {
            b.iter(|| criterion::black_box(trie.snapshot().unwrap()));
        });
        drop(trie);
        gc.shutdown().unwrap();
    }
    group.finish();
}

criterion_group!(benches, bench_ctrie);
criterion_main!(benches);
