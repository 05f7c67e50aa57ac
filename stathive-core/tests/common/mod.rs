/*!
Behaviour every snapshot backend must show.

Each backend test file builds fresh stores and runs the checks below through
`backend_suite!`.
*/

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stathive_core::model::MAX_TREE_DEPTH;
use stathive_core::{Snapshot, SnapshotStore, StatNode, StoreError};

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// Random tree with sibling-unique names and consistent counters
pub fn random_tree(seed: u64) -> StatNode {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut root = StatNode::new("root");
    fill(&mut root, &mut rng, 0);
    root
}

fn fill(node: &mut StatNode, rng: &mut StdRng, depth: usize) {
    for _ in 0..rng.gen_range(0..20) {
        node.record(rng.gen_range(0..5_000), rng.gen_bool(0.1));
    }
    if depth >= 3 {
        return;
    }
    for i in 0..rng.gen_range(1..4) {
        let mut child = StatNode::new(format!("op-{depth}-{i}"));
        fill(&mut child, rng, depth + 1);
        node.insert_child(child);
    }
}

pub fn snapshot(root: StatNode, start: DateTime<Utc>, end: DateTime<Utc>, tag: &str) -> Snapshot {
    Snapshot::new(root, start, end, tag).unwrap()
}

fn everything() -> (DateTime<Utc>, DateTime<Utc>) {
    (at(1980, 1, 1, 0, 0), Utc::now() + Duration::days(365))
}

pub fn roundtrip(store: &dyn SnapshotStore) {
    let start = Utc::now() - Duration::minutes(5);
    // sub-millisecond precision is dropped on construction
    let original = snapshot(random_tree(7), start, Utc::now(), "web-1");

    let id = store.save(&original, None).unwrap();
    let loaded = store.load(&id).unwrap();

    assert_eq!(loaded, original);
    assert_eq!(loaded.root().node_count(), original.root().node_count());
    assert_eq!(loaded.window_start(), original.window_start());
    assert_eq!(loaded.instance_tag(), "web-1");
}

pub fn range_and_retention(store: &dyn SnapshotStore) {
    let tag = "retention";
    let old = snapshot(random_tree(1), at(1990, 1, 1, 8, 0), at(1990, 1, 1, 8, 15), tag);
    let now = Utc::now();
    let fresh = snapshot(random_tree(2), now - Duration::minutes(15), now, tag);
    let other_old = snapshot(random_tree(3), at(1990, 1, 1, 8, 0), at(1990, 1, 1, 8, 15), "other");

    let old_id = store.save(&old, None).unwrap();
    let fresh_id = store.save(&fresh, None).unwrap();
    let other_id = store.save(&other_old, None).unwrap();

    let (from, to) = everything();
    let found = store.find(from, to, None, Some(tag)).unwrap();
    assert_eq!(found, vec![fresh_id.clone(), old_id.clone()]);

    assert_eq!(store.cleanup(1, Some(tag)).unwrap(), 1);
    assert_eq!(store.find(from, to, None, Some(tag)).unwrap(), vec![fresh_id.clone()]);
    assert!(matches!(store.load(&old_id), Err(StoreError::NotFound(_))));

    // other tags are untouched by a scoped cleanup
    assert_eq!(store.load(&other_id).unwrap(), other_old);
    assert_eq!(store.cleanup(1, None).unwrap(), 1);
    assert_eq!(store.cleanup(1, None).unwrap(), 0);
    assert_eq!(store.load(&fresh_id).unwrap(), fresh);
}

pub fn window_edges(store: &dyn SnapshotStore) {
    let s = snapshot(StatNode::new("root"), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "edge");
    let id = store.save(&s, None).unwrap();

    // closed intervals: touching either edge counts
    assert_eq!(store.find(at(2022, 3, 1, 10, 5), at(2022, 3, 1, 11, 0), None, None).unwrap(), vec![id.clone()]);
    assert_eq!(store.find(at(2022, 3, 1, 9, 0), at(2022, 3, 1, 10, 0), None, None).unwrap(), vec![id.clone()]);
    assert_eq!(store.find(at(2022, 3, 1, 10, 1), at(2022, 3, 1, 10, 2), None, None).unwrap(), vec![id]);

    assert!(store.find(at(2022, 3, 1, 10, 6), at(2022, 3, 1, 11, 0), None, None).unwrap().is_empty());
    assert!(store.find(at(2022, 3, 1, 11, 0), at(2022, 3, 1, 9, 0), None, None).unwrap().is_empty());
}

pub fn ordering_and_filters(store: &dyn SnapshotStore) {
    let orders = StatNode::new("root").with_child(StatNode::new("GET /orders").with_counters(2, 0, 3, 9, 12));
    let users = StatNode::new("root")
        .with_child(StatNode::new("GET /users").with_child(StatNode::new("db.query").with_counters(1, 0, 4, 4, 4)));

    store.save(&snapshot(orders.clone(), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1"), Some("b")).unwrap();
    store.save(&snapshot(users.clone(), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-2"), Some("a")).unwrap();
    store.save(&snapshot(users, at(2022, 3, 1, 11, 0), at(2022, 3, 1, 11, 5), "web-1"), Some("c")).unwrap();
    store.save(&snapshot(orders, at(2022, 3, 1, 9, 0), at(2022, 3, 1, 9, 5), "web-2"), Some("d")).unwrap();

    let (from, to) = everything();
    // newest window first, ties by identifier
    assert_eq!(store.find(from, to, None, None).unwrap(), vec!["c", "a", "b", "d"]);
    assert_eq!(store.find(from, to, None, Some("web-1")).unwrap(), vec!["c", "b"]);
    assert_eq!(store.find(from, to, Some("db.query"), None).unwrap(), vec!["c", "a"]);
    assert_eq!(store.find(from, to, Some("GET /orders"), Some("web-2")).unwrap(), vec!["d"]);
    assert!(store.find(from, to, Some("GET /missing"), None).unwrap().is_empty());
    assert!(store.find(from, to, None, Some("web-3")).unwrap().is_empty());

    assert_eq!(store.instances(from, to).unwrap(), vec!["web-1", "web-2"]);
    assert_eq!(
        store.instances(at(2022, 3, 1, 10, 30), at(2022, 3, 1, 12, 0)).unwrap(),
        vec!["web-1"]
    );
}

pub fn aggregated(store: &dyn SnapshotStore) {
    let first = StatNode::new("root").with_child(StatNode::new("GET /orders").with_counters(2, 1, 5, 20, 25));
    let second = StatNode::new("root").with_child(StatNode::new("GET /orders").with_counters(3, 0, 2, 40, 60));

    store.save(&snapshot(first, at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1"), None).unwrap();
    store.save(&snapshot(second, at(2022, 3, 1, 10, 5), at(2022, 3, 1, 10, 10), "web-1"), None).unwrap();

    let merged = store
        .load_aggregated(at(2022, 3, 1, 0, 0), at(2022, 3, 1, 23, 0), Some("web-1"), false)
        .unwrap()
        .unwrap();
    let orders = merged.root().child("GET /orders").unwrap();
    assert_eq!(orders.count, 5);
    assert_eq!(orders.error_count, 1);
    assert_eq!(orders.min_duration_ms, 2);
    assert_eq!(orders.max_duration_ms, 40);
    assert_eq!(orders.total_duration_ms, 85);
    assert_eq!(merged.window_start(), at(2022, 3, 1, 10, 0));
    assert_eq!(merged.window_end(), at(2022, 3, 1, 10, 10));

    assert!(store
        .load_aggregated(at(2022, 3, 2, 0, 0), at(2022, 3, 2, 23, 0), None, false)
        .unwrap()
        .is_none());
}

pub fn details_and_top_level(store: &dyn SnapshotStore) {
    let first = StatNode::new("root")
        .with_child(
            StatNode::new("GET /orders")
                .with_counters(2, 0, 5, 20, 25)
                .with_child(StatNode::new("db.query").with_counters(2, 0, 1, 4, 5)),
        )
        .with_child(
            StatNode::new("GET /users")
                .with_counters(1, 0, 3, 3, 3)
                .with_child(StatNode::new("db.query").with_counters(1, 0, 2, 2, 2)),
        );
    let second = StatNode::new("root").with_child(
        StatNode::new("GET /orders")
            .with_counters(3, 1, 2, 40, 60)
            .with_child(StatNode::new("cache").with_counters(3, 0, 1, 1, 3)),
    );
    let other = StatNode::new("root").with_child(
        StatNode::new("GET /health").with_child(StatNode::new("db.query").with_counters(4, 0, 9, 9, 36)),
    );

    store.save(&snapshot(first, at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1"), None).unwrap();
    store.save(&snapshot(second, at(2022, 3, 1, 10, 5), at(2022, 3, 1, 10, 10), "web-1"), None).unwrap();
    store.save(&snapshot(other, at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-2"), None).unwrap();
    let (from, to) = (at(2022, 3, 1, 0, 0), at(2022, 3, 1, 23, 0));

    let orders = store.load_details("GET /orders", from, to, None).unwrap().unwrap();
    assert_eq!(orders.name(), "GET /orders");
    assert_eq!(orders.count, 5);
    assert_eq!(orders.error_count, 1);
    assert_eq!(orders.min_duration_ms, 2);
    assert_eq!(orders.max_duration_ms, 40);
    assert_eq!(orders.total_duration_ms, 85);
    assert_eq!(orders.child("db.query").unwrap().count, 2);
    assert_eq!(orders.child("cache").unwrap().count, 3);

    // nested nodes merge across parents and snapshots
    let db = store.load_details("db.query", from, to, Some("web-1")).unwrap().unwrap();
    assert_eq!(db.count, 3);
    assert_eq!(db.min_duration_ms, 1);
    assert_eq!(db.max_duration_ms, 4);
    assert_eq!(db.total_duration_ms, 7);
    assert_eq!(store.load_details("db.query", from, to, None).unwrap().unwrap().count, 7);

    assert!(store.load_details("GET /missing", from, to, None).unwrap().is_none());
    assert!(store
        .load_details("GET /orders", at(2022, 3, 2, 0, 0), at(2022, 3, 2, 23, 0), None)
        .unwrap()
        .is_none());

    let top = store.load_aggregated(from, to, Some("web-1"), true).unwrap().unwrap();
    assert_eq!(top.root().node_count(), 3);
    assert_eq!(top.root().child("GET /orders").unwrap().count, 5);
    assert!(!top.root().child("GET /orders").unwrap().has_children());
    assert!(!top.root().child("GET /users").unwrap().has_children());

    let full = store.load_aggregated(from, to, Some("web-1"), false).unwrap().unwrap();
    assert_eq!(full.root().child("GET /orders").unwrap().children().count(), 2);
}

pub fn unbounded_retention(store: &dyn SnapshotStore) {
    let old = snapshot(random_tree(21), at(1990, 1, 1, 8, 0), at(1990, 1, 1, 8, 15), "old");
    let id = store.save(&old, None).unwrap();

    assert_eq!(store.cleanup(u32::MAX, None).unwrap(), 0);
    assert_eq!(store.cleanup(u32::MAX, Some("old")).unwrap(), 0);
    assert_eq!(store.load(&id).unwrap(), old);
}

pub fn window_outside_supported_years(store: &dyn SnapshotStore) {
    let far = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
    assert!(matches!(
        Snapshot::new(StatNode::new("root"), far, far, "future"),
        Err(StoreError::InvalidSnapshot(_))
    ));

    // a decoded snapshot skips the constructor, saving must still refuse it
    let valid = snapshot(StatNode::new("root"), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "future");
    let mut value = serde_json::to_value(&valid).unwrap();
    value["window_end"] = serde_json::to_value(far).unwrap();
    let future: Snapshot = serde_json::from_value(value).unwrap();

    assert!(matches!(store.save(&future, Some("future")), Err(StoreError::InvalidSnapshot(_))));
    assert!(matches!(store.load("future"), Err(StoreError::NotFound(_))));
    let (from, to) = everything();
    assert!(store.find(from, to, None, None).unwrap().is_empty());
}

fn chain(levels: usize) -> StatNode {
    (1..levels).rev().fold(
        StatNode::new(format!("level-{levels}")).with_counters(1, 0, 1, 1, 1),
        |child, level| StatNode::new(format!("level-{level}")).with_child(child),
    )
}

pub fn deep_trees(store: &dyn SnapshotStore) {
    let deepest = snapshot(chain(MAX_TREE_DEPTH), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "deep");
    assert_eq!(deepest.root().depth(), MAX_TREE_DEPTH);
    let id = store.save(&deepest, None).unwrap();
    assert_eq!(store.load(&id).unwrap(), deepest);

    let too_deep = snapshot(chain(MAX_TREE_DEPTH + 1), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "deep");
    assert!(matches!(store.save(&too_deep, None), Err(StoreError::InvalidSnapshot(_))));

    let (from, to) = everything();
    assert_eq!(store.find(from, to, None, None).unwrap(), vec![id]);
}

pub fn duplicate_identifier(store: &dyn SnapshotStore) {
    let first = snapshot(random_tree(11), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1");
    let second = snapshot(random_tree(12), at(2022, 3, 1, 11, 0), at(2022, 3, 1, 11, 5), "web-1");

    assert_eq!(store.save(&first, Some("nightly-1")).unwrap(), "nightly-1");
    let err = store.save(&second, Some("nightly-1")).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateIdentifier(_)), "{err:?}");
    assert_eq!(store.load("nightly-1").unwrap(), first);

    let (from, to) = everything();
    assert_eq!(store.find(from, to, None, None).unwrap(), vec!["nightly-1"]);
}

pub fn rejects_invalid_input(store: &dyn SnapshotStore) {
    let mut broken = StatNode::new("root");
    broken.insert_child(StatNode::new("bad").with_counters(1, 2, 1, 1, 1));
    let s = snapshot(broken, at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1");
    assert!(matches!(store.save(&s, None), Err(StoreError::InvalidSnapshot(_))));

    let ok = snapshot(StatNode::new("root"), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1");
    assert!(matches!(store.save(&ok, Some("")), Err(StoreError::InvalidSnapshot(_))));

    let (from, to) = everything();
    assert!(store.find(from, to, None, None).unwrap().is_empty());
}

pub fn unknown_identifier(store: &dyn SnapshotStore) {
    assert!(matches!(store.load("does-not-exist"), Err(StoreError::NotFound(_))));
}

pub fn not_ready(store: &dyn SnapshotStore) {
    assert!(!store.is_ready());
    let s = snapshot(StatNode::new("root"), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1");
    let (from, to) = everything();

    assert!(matches!(store.save(&s, None), Err(StoreError::NotReady)));
    assert!(matches!(store.find(from, to, None, None), Err(StoreError::NotReady)));
    assert!(matches!(store.load("x"), Err(StoreError::NotReady)));
    assert!(matches!(store.cleanup(1, None), Err(StoreError::NotReady)));
    assert!(matches!(store.instances(from, to), Err(StoreError::NotReady)));
}

pub fn idempotent_setup(store: &dyn SnapshotStore, init: &str, other_init: &str) {
    let s = snapshot(random_tree(5), at(2022, 3, 1, 10, 0), at(2022, 3, 1, 10, 5), "web-1");
    let id = store.save(&s, None).unwrap();

    store.setup(init).unwrap();
    store.setup(init).unwrap();
    assert_eq!(store.load(&id).unwrap(), s);

    let err = store.setup(other_init).unwrap_err();
    assert!(matches!(err, StoreError::Configuration(_)));
    assert!(store.is_ready());

    let (from, to) = everything();
    assert_eq!(store.find(from, to, None, None).unwrap(), vec![id]);
}

pub fn concurrent_saves(store: &dyn SnapshotStore) {
    let ids: Vec<(String, Snapshot)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8u64)
            .map(|thread| {
                scope.spawn(move || {
                    (0..4u64)
                        .map(|i| {
                            let end = Utc::now();
                            let s = snapshot(random_tree(thread * 100 + i), end - Duration::minutes(1), end, &format!("t{thread}"));
                            (store.save(&s, None).unwrap(), s)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(ids.len(), 32);
    for (id, s) in &ids {
        assert_eq!(&store.load(id).unwrap(), s);
    }
    let (from, to) = everything();
    assert_eq!(store.find(from, to, None, None).unwrap().len(), 32);
    assert_eq!(store.instances(from, to).unwrap().len(), 8);
}

pub fn concurrent_cleanup(store: &dyn SnapshotStore) {
    for i in 0..10 {
        let old = snapshot(random_tree(i), at(1990, 1, 1, 8, 0), at(1990, 1, 1, 8, 15), "old");
        store.save(&old, None).unwrap();
    }

    let fresh: Vec<String> = std::thread::scope(|scope| {
        let savers: Vec<_> = (0..4u64)
            .map(|thread| {
                scope.spawn(move || {
                    (0..5u64)
                        .map(|i| {
                            let end = Utc::now();
                            let s = snapshot(random_tree(500 + thread * 10 + i), end - Duration::minutes(1), end, "fresh");
                            store.save(&s, None).unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let cleaners: Vec<_> = (0..3)
            .map(|_| scope.spawn(move || (0..5).map(|_| store.cleanup(1, None).unwrap()).sum::<usize>()))
            .collect();

        let removed: usize = cleaners.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(removed, 10);
        savers.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let (from, to) = everything();
    let mut found = store.find(from, to, None, None).unwrap();
    let mut expected = fresh.clone();
    found.sort();
    expected.sort();
    assert_eq!(found, expected);
    for id in &fresh {
        store.load(id).unwrap();
    }
}

/// Generates one test per suite check; `$fresh` returns `(guard, store, init, other_init)`
/// with the store already set up
macro_rules! backend_suite {
    ($fresh:expr, $unconfigured:expr) => {
        #[test]
        fn roundtrip() {
            let (_guard, store, _, _) = $fresh();
            common::roundtrip(&store);
        }

        #[test]
        fn range_and_retention() {
            let (_guard, store, _, _) = $fresh();
            common::range_and_retention(&store);
        }

        #[test]
        fn window_edges() {
            let (_guard, store, _, _) = $fresh();
            common::window_edges(&store);
        }

        #[test]
        fn ordering_and_filters() {
            let (_guard, store, _, _) = $fresh();
            common::ordering_and_filters(&store);
        }

        #[test]
        fn aggregated() {
            let (_guard, store, _, _) = $fresh();
            common::aggregated(&store);
        }

        #[test]
        fn details_and_top_level() {
            let (_guard, store, _, _) = $fresh();
            common::details_and_top_level(&store);
        }

        #[test]
        fn unbounded_retention() {
            let (_guard, store, _, _) = $fresh();
            common::unbounded_retention(&store);
        }

        #[test]
        fn window_outside_supported_years() {
            let (_guard, store, _, _) = $fresh();
            common::window_outside_supported_years(&store);
        }

        #[test]
        fn deep_trees() {
            let (_guard, store, _, _) = $fresh();
            common::deep_trees(&store);
        }

        #[test]
        fn duplicate_identifier() {
            let (_guard, store, _, _) = $fresh();
            common::duplicate_identifier(&store);
        }

        #[test]
        fn rejects_invalid_input() {
            let (_guard, store, _, _) = $fresh();
            common::rejects_invalid_input(&store);
        }

        #[test]
        fn unknown_identifier() {
            let (_guard, store, _, _) = $fresh();
            common::unknown_identifier(&store);
        }

        #[test]
        fn not_ready() {
            common::not_ready(&$unconfigured());
        }

        #[test]
        fn idempotent_setup() {
            let (_guard, store, init, other_init) = $fresh();
            common::idempotent_setup(&store, &init, &other_init);
        }

        #[test]
        fn concurrent_saves() {
            let (_guard, store, _, _) = $fresh();
            common::concurrent_saves(&store);
        }

        #[test]
        fn concurrent_cleanup() {
            let (_guard, store, _, _) = $fresh();
            common::concurrent_cleanup(&store);
        }
    };
}
