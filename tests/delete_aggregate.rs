use std::collections::BTreeMap;

use strata::chunk::window_start;
use strata::config::DAY_MS;
use strata::{AggregateFunction, Event, EventQuery, EventStore, Namespace, StoreConfig};
use tempfile::{tempdir, TempDir};

const MINUTE_MS: i64 = 60_000;

fn open(config: impl FnOnce(StoreConfig) -> StoreConfig) -> (TempDir, EventStore, Namespace) {
    let dir = tempdir().expect("tempdir");
    let store = EventStore::initialize(config(StoreConfig::new(dir.path()))).expect("initialize");
    let ns = Namespace::new("ops").expect("namespace");
    store.create(&ns).expect("create namespace");
    (dir, store, ns)
}

fn base() -> i64 {
    window_start(1_700_000_000_000, DAY_MS)
}

#[test]
fn delete_counts_and_removes_matches() {
    let (_dir, store, ns) = open(|c| c);
    let t = base();
    let events = vec![
        Event::new(t).with_metadata("host", "a").with_dimension("cpu", 10.0),
        Event::new(t + 1).with_metadata("host", "a").with_dimension("cpu", 90.0),
        Event::new(t + 2).with_metadata("host", "b").with_dimension("cpu", 95.0),
        Event::new(t + 3).with_metadata("host", "b"),
        Event::new(t + DAY_MS).with_metadata("host", "a").with_dimension("cpu", 99.0),
    ];
    store.store(&ns, &events).expect("store");

    let range = EventQuery::new(t, t + 2 * DAY_MS);
    let deleted = store
        .delete(&ns, &range.clone().dimension("cpu", ">=90"))
        .expect("delete");
    assert_eq!(deleted, 3);

    let left: Vec<i64> = store
        .get(&ns, &range)
        .expect("get")
        .iter()
        .map(|e| e.timestamp_ms)
        .collect();
    assert_eq!(left, vec![t, t + 3]);

    // Nothing left to match.
    assert_eq!(
        store
            .delete(&ns, &range.clone().dimension("cpu", ">=90"))
            .expect("delete again"),
        0
    );
    // Chunks stay until expiry, even when empty.
    assert_eq!(store.chunks(&ns).expect("chunks").len(), 3);
}

#[test]
fn metadata_distinct_values() {
    let (_dir, store, ns) = open(|c| c);
    let t = base();
    store
        .store(
            &ns,
            &[
                Event::new(t).with_metadata("host", "web-1").with_metadata("region", "eu"),
                Event::new(t + 1).with_metadata("host", "web-2").with_metadata("region", "eu"),
                Event::new(t + 2).with_metadata("host", "web-1").with_dimension("cpu", 1.0),
                Event::new(t + 3).with_metadata("host", "db-1").with_dimension("cpu", 80.0),
                Event::new(t + DAY_MS).with_metadata("host", "db-2"),
                Event::new(t + 4).with_dimension("cpu", 50.0),
            ],
        )
        .expect("store");

    let range = EventQuery::new(t, t + DAY_MS);
    let all: Vec<String> = store
        .metadata(&ns, "host", &range)
        .expect("hosts")
        .into_iter()
        .collect();
    assert_eq!(all, vec!["db-1", "db-2", "web-1", "web-2"]);

    let busy: Vec<String> = store
        .metadata(&ns, "host", &range.clone().dimension("cpu", ">10"))
        .expect("busy hosts")
        .into_iter()
        .collect();
    assert_eq!(busy, vec!["db-1"]);

    let regions = store.metadata(&ns, "region", &range).expect("regions");
    assert_eq!(regions.len(), 1);
    assert!(store
        .metadata(&ns, "missing", &range)
        .expect("missing key")
        .is_empty());
}

#[test]
fn aggregate_merges_buckets_across_batches() {
    // One chunk per batch forces every bucket to be merged from partials.
    let (_dir, store, ns) = open(|c| StoreConfig {
        aggregate_batch_size: 1,
        ..c
    });
    let t = base();
    store
        .store(
            &ns,
            &[
                Event::new(t).with_dimension("cpu", 1.0),
                Event::new(t + 1).with_dimension("cpu", 2.0),
                Event::new(t + 2).with_dimension("cpu", 3.0),
                Event::new(t + 3).with_metadata("host", "a").with_dimension("cpu", 10.0),
                Event::new(t + MINUTE_MS).with_metadata("host", "a").with_dimension("cpu", 7.0),
                // Identical (ts, value) rows in different chunks must both count.
                Event::new(t + 2 * MINUTE_MS).with_dimension("cpu", 5.0),
                Event::new(t + 2 * MINUTE_MS).with_metadata("host", "b").with_dimension("cpu", 5.0),
            ],
        )
        .expect("store");
    let range = EventQuery::new(t, t + DAY_MS - 1);
    let run = |function| {
        store
            .aggregate(&ns, "cpu", &range, MINUTE_MS, function)
            .expect("aggregate")
    };

    let m0 = t;
    let m1 = t + MINUTE_MS;
    let m2 = t + 2 * MINUTE_MS;
    assert_eq!(run(AggregateFunction::Avg), BTreeMap::from([(m0, 4.0), (m1, 7.0), (m2, 5.0)]));
    assert_eq!(run(AggregateFunction::Sum), BTreeMap::from([(m0, 16.0), (m1, 7.0), (m2, 10.0)]));
    assert_eq!(run(AggregateFunction::Count), BTreeMap::from([(m0, 4.0), (m1, 1.0), (m2, 2.0)]));
    assert_eq!(run(AggregateFunction::Min), BTreeMap::from([(m0, 1.0), (m1, 7.0), (m2, 5.0)]));
    assert_eq!(run(AggregateFunction::Max), BTreeMap::from([(m0, 10.0), (m1, 7.0), (m2, 5.0)]));

    let filtered = store
        .aggregate(
            &ns,
            "cpu",
            &range.clone().metadata("host", "a"),
            MINUTE_MS,
            AggregateFunction::Sum,
        )
        .expect("filtered");
    assert_eq!(filtered, BTreeMap::from([(m0, 10.0), (m1, 7.0)]));
}

#[test]
fn aggregate_of_unknown_dimension_is_empty() {
    let (_dir, store, ns) = open(|c| c);
    let t = base();
    store
        .store(&ns, &[Event::new(t).with_dimension("cpu", 1.0)])
        .expect("store");
    assert!(store
        .aggregate(&ns, "mem", &EventQuery::new(t, t + 1), MINUTE_MS, AggregateFunction::Avg)
        .expect("aggregate")
        .is_empty());
}

#[test]
fn aggregate_handles_extreme_timestamps_and_intervals() {
    let (_dir, store, ns) = open(|c| c);
    store
        .store(
            &ns,
            &[
                Event::new(i64::MIN).with_dimension("cpu", 1.0),
                Event::new(-1).with_dimension("cpu", 2.0),
                Event::new(i64::MAX).with_dimension("cpu", 3.0),
            ],
        )
        .expect("store");
    let range = EventQuery::new(i64::MIN, i64::MAX);

    // The bucket below i64::MIN is clamped to it, like chunk windows.
    let by_minute = store
        .aggregate(&ns, "cpu", &range, MINUTE_MS, AggregateFunction::Sum)
        .expect("aggregate by minute");
    assert_eq!(
        by_minute,
        BTreeMap::from([
            (i64::MIN, 1.0),
            (-MINUTE_MS, 2.0),
            (i64::MAX - i64::MAX % MINUTE_MS, 3.0),
        ])
    );

    let widest = store
        .aggregate(&ns, "cpu", &range, i64::MAX, AggregateFunction::Count)
        .expect("aggregate with widest interval");
    assert_eq!(
        widest,
        BTreeMap::from([(i64::MIN, 1.0), (-i64::MAX, 1.0), (i64::MAX, 1.0)])
    );

    let recent = store
        .aggregate(&ns, "cpu", &EventQuery::new(-1, i64::MAX), i64::MAX, AggregateFunction::Max)
        .expect("aggregate recent");
    assert_eq!(recent, BTreeMap::from([(-i64::MAX, 2.0), (i64::MAX, 3.0)]));
}
