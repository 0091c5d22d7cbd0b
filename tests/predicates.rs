use std::collections::BTreeSet;

use strata::{Error, Event, EventQuery, EventStore, Namespace, StoreConfig};
use tempfile::{tempdir, TempDir};

const BASE_MS: i64 = 1_700_000_000_000;

fn seeded() -> (TempDir, EventStore, Namespace) {
    let dir = tempdir().expect("tempdir");
    let store = EventStore::initialize(StoreConfig::new(dir.path())).expect("initialize");
    let ns = Namespace::new("hosts").expect("namespace");
    store.create(&ns).expect("create namespace");

    let hosts = ["web-1", "web-2", "db-1", "cache-1"];
    let mut events = Vec::new();
    for (i, host) in hosts.iter().enumerate() {
        for j in 0..10 {
            events.push(
                Event::new(BASE_MS + (i * 10 + j) as i64)
                    .with_metadata("host", *host)
                    .with_dimension("cpu", (j * 10) as f64),
            );
        }
    }
    // A second schema without the cpu dimension.
    events.push(Event::new(BASE_MS + 100).with_metadata("host", "web-3"));
    store.store(&ns, &events).expect("store");
    (dir, store, ns)
}

fn hosts(store: &EventStore, ns: &Namespace, query: EventQuery) -> BTreeSet<String> {
    store
        .get(ns, &query)
        .expect("get")
        .into_iter()
        .map(|e| e.metadata["host"].clone())
        .collect()
}

fn range() -> EventQuery {
    EventQuery::new(BASE_MS, BASE_MS + 1_000)
}

fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[test]
fn metadata_equality_and_negation() {
    let (_dir, store, ns) = seeded();
    assert_eq!(hosts(&store, &ns, range().metadata("host", "db-1")), set(&["db-1"]));
    assert_eq!(hosts(&store, &ns, range().metadata("host", "=db-1")), set(&["db-1"]));
    assert_eq!(
        hosts(&store, &ns, range().metadata("host", "!=db-1")),
        set(&["web-1", "web-2", "web-3", "cache-1"])
    );
    assert!(hosts(&store, &ns, range().metadata("host", "nope")).is_empty());
}

#[test]
fn metadata_pattern_match() {
    let (_dir, store, ns) = seeded();
    assert_eq!(
        hosts(&store, &ns, range().metadata("host", "~^web-")),
        set(&["web-1", "web-2", "web-3"])
    );
    assert_eq!(
        hosts(&store, &ns, range().metadata("host", "!~^web-")),
        set(&["db-1", "cache-1"])
    );
    assert_eq!(
        hosts(&store, &ns, range().metadata("host", "~^c.*[0-9]$")),
        set(&["cache-1"])
    );
}

#[test]
fn invalid_pattern_is_an_error() {
    let (_dir, store, ns) = seeded();
    let err = store
        .get(&ns, &range().metadata("host", "~("))
        .expect_err("bad regex");
    assert!(matches!(err, Error::ChunkFailed { .. }), "{err}");
}

#[test]
fn dimension_ranges_and_comparisons() {
    let (_dir, store, ns) = seeded();
    let count = |expr: &str| {
        store
            .get(&ns, &range().dimension("cpu", expr))
            .expect("get")
            .len()
    };
    // cpu values are 0, 10, ..., 90 for each of four hosts.
    assert_eq!(count("20..29"), 4);
    assert_eq!(count("20..30"), 8);
    assert_eq!(count(">=80"), 8);
    assert_eq!(count(">80"), 4);
    assert_eq!(count("<10"), 4);
    assert_eq!(count("<=10"), 8);
    assert_eq!(count("50"), 4);
    assert_eq!(count("=50"), 4);
    assert_eq!(count("!=50"), 36);
}

#[test]
fn combined_predicates_and_key_requirements() {
    let (_dir, store, ns) = seeded();
    let events = store
        .get(
            &ns,
            &range().metadata("host", "~^web-").dimension("cpu", ">=50"),
        )
        .expect("get");
    assert_eq!(events.len(), 10);
    assert!(events.iter().all(|e| e.dimensions["cpu"] >= 50.0));

    // The cpu-less chunk is excluded as soon as cpu is constrained.
    assert!(!hosts(&store, &ns, range().dimension("cpu", ">=0")).contains("web-3"));
    // A key no chunk carries matches nothing.
    assert!(store
        .get(&ns, &range().metadata("region", "eu"))
        .expect("get")
        .is_empty());
}

#[test]
fn malformed_dimension_expression_is_rejected() {
    let (_dir, store, ns) = seeded();
    assert!(matches!(
        store.get(&ns, &range().dimension("cpu", ">=high")),
        Err(Error::InvalidQuery(_))
    ));
}
