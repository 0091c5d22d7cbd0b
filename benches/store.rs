use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{tempdir, TempDir};

use strata::{AggregateFunction, Event, EventQuery, EventStore, Namespace, StoreConfig};

const BASE_MS: i64 = 1_700_000_000_000;
const HOSTS: [&str; 4] = ["web-1", "web-2", "db-1", "cache-1"];

fn events(rng: &mut StdRng, count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::new(BASE_MS + i as i64 * 100)
                .with_metadata("host", HOSTS[rng.gen_range(0..HOSTS.len())])
                .with_dimension("cpu", rng.gen_range(0.0..100.0))
                .with_payload(vec![0u8; 64])
        })
        .collect()
}

fn open() -> (TempDir, EventStore, Namespace) {
    let dir = tempdir().expect("tempdir");
    let store = EventStore::initialize(StoreConfig::new(dir.path())).expect("store");
    let ns = Namespace::new("bench").expect("namespace");
    store.create(&ns).expect("create");
    (dir, store, ns)
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    for &batch in &[100_usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    let (dir, store, ns) = open();
                    let events = events(&mut StdRng::seed_from_u64(7), batch);
                    (dir, store, ns, events)
                },
                |(_dir, store, ns, events)| {
                    store.store(&ns, black_box(&events)).expect("store");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let (_dir, store, ns) = open();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..10 {
        store.store(&ns, &events(&mut rng, 10_000)).expect("seed");
    }
    let range = EventQuery::new(BASE_MS, BASE_MS + 1_000_000);

    c.bench_function("get_filtered", |b| {
        let query = range.clone().metadata("host", "~^web-").dimension("cpu", ">=50");
        b.iter(|| store.get(&ns, black_box(&query)).expect("get"))
    });
    c.bench_function("last", |b| b.iter(|| store.last(&ns, black_box(&range)).expect("last")));
    c.bench_function("aggregate_avg_1m", |b| {
        b.iter(|| {
            store
                .aggregate(&ns, "cpu", black_box(&range), 60_000, AggregateFunction::Avg)
                .expect("aggregate")
        })
    });
}

criterion_group!(benches, bench_store, bench_read);
criterion_main!(benches);
