//! Property tests for the query helpers, the cache and live result sets.

use livesync::observe::reconcile;
use livesync::query::sort::compare_documents;
use livesync::query::{compare_values, matches, sort_documents};
use livesync::{
    document, top_level_diff, DocId, Document, DocumentCache, InMemoryBus, MemoryStore,
    ObserveCallbacks, QueryOptions, RaceDetectionConfig, SortKey, SyncConfig, SyncRegistry,
    VersionMarker,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

// --- Strategies ---

fn leaf_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-50i64..50).prop_map(|n| json!(n)),
        "[a-c]{0,3}".prop_map(Value::String),
    ]
}

fn any_value() -> impl Strategy<Value = Value> {
    leaf_value().prop_recursive(2, 8, 3, |inner| {
        prop::collection::vec(inner, 0..3).prop_map(Value::Array)
    })
}

/// A document with `_id` and a few of the fields `a` to `e`.
fn small_document(id: &'static str) -> impl Strategy<Value = Document> {
    prop::collection::btree_map("[a-e]", leaf_value(), 0..5).prop_map(move |fields| {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), json!(id));
        for (k, v) in fields {
            doc.insert(k, v);
        }
        doc
    })
}

fn id_set() -> impl Strategy<Value = HashSet<u8>> {
    prop::collection::hash_set(0u8..30, 0..15)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set(u8),
    Pin(u8),
    Unpin(u8),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0u8..6).prop_map(CacheOp::Set),
        (0u8..6).prop_map(CacheOp::Pin),
        (0u8..6).prop_map(CacheOp::Unpin),
    ]
}

#[derive(Debug, Clone)]
enum WriteOp {
    Insert(u8, i64),
    Set(u8, i64),
    Remove(u8),
}

fn write_op() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        (0u8..5, 0i64..10).prop_map(|(k, v)| WriteOp::Insert(k, v)),
        (0u8..5, 0i64..10).prop_map(|(k, v)| WriteOp::Set(k, v)),
        (0u8..5).prop_map(WriteOp::Remove),
    ]
}

fn doc_id(n: u8) -> DocId {
    DocId::new(format!("d{}", n))
}

// --- Query Helper Properties ---

proptest! {
    #[test]
    fn prop_reconcile_partitions_ids(tracked in id_set(), fresh in id_set()) {
        let tracked_map: HashMap<DocId, VersionMarker> =
            tracked.iter().map(|n| (doc_id(*n), VersionMarker(0))).collect();
        let fresh_map: HashMap<DocId, ()> = fresh.iter().map(|n| (doc_id(*n), ())).collect();

        let rec = reconcile(&tracked_map, &fresh_map);

        prop_assert_eq!(rec.both.len() + rec.left_only.len(), tracked.len());
        prop_assert_eq!(rec.both.len() + rec.right_only.len(), fresh.len());
        for id in &rec.both {
            prop_assert!(tracked_map.contains_key(id) && fresh_map.contains_key(id));
        }
        for id in &rec.left_only {
            prop_assert!(!fresh_map.contains_key(id));
        }
        for id in &rec.right_only {
            prop_assert!(!tracked_map.contains_key(id));
        }
        prop_assert_eq!(rec.is_settled(), tracked == fresh);
    }

    #[test]
    fn prop_diff_replays_to_target(before in small_document("x"), after in small_document("x")) {
        let diff = top_level_diff(&before, &after);
        let mut replayed = before.clone();
        for field in &diff.updated {
            replayed.insert(field.clone(), after[field].clone());
        }
        for field in &diff.cleared {
            replayed.remove(field);
        }
        prop_assert_eq!(&replayed, &after);
        prop_assert_eq!(diff.is_empty(), before == after);
    }

    #[test]
    fn prop_compare_values_is_antisymmetric(a in any_value(), b in any_value()) {
        prop_assert_eq!(compare_values(&a, &b), compare_values(&b, &a).reverse());
        prop_assert_eq!(compare_values(&a, &a), Ordering::Equal);
    }

    #[test]
    fn prop_sorted_documents_are_ordered(
        values in prop::collection::vec((leaf_value(), leaf_value()), 0..12),
        descending in any::<bool>(),
    ) {
        let mut docs: Vec<Document> = values
            .into_iter()
            .enumerate()
            .map(|(i, (a, b))| document(json!({"_id": format!("d{}", i), "a": a, "b": b})).unwrap())
            .collect();
        let keys = if descending {
            vec![SortKey::desc("a"), SortKey::asc("b")]
        } else {
            vec![SortKey::asc("a"), SortKey::asc("b")]
        };
        let count = docs.len();
        sort_documents(&mut docs, &keys);

        prop_assert_eq!(docs.len(), count);
        for pair in docs.windows(2) {
            prop_assert_ne!(compare_documents(&pair[0], &pair[1], &keys), Ordering::Greater);
        }
    }

    #[test]
    fn prop_in_matches_any_listed_value(n in -5i64..5, a in -5i64..5, b in -5i64..5) {
        let doc = document(json!({"_id": "x", "n": n})).unwrap();
        let listed = matches(&doc, &json!({"n": {"$in": [a, b]}})).unwrap();
        let either = matches(&doc, &json!({"n": a})).unwrap() || matches(&doc, &json!({"n": b})).unwrap();
        prop_assert_eq!(listed, either);
        let excluded = matches(&doc, &json!({"n": {"$nin": [a, b]}})).unwrap();
        prop_assert_eq!(excluded, !listed);
    }

    #[test]
    fn prop_range_and_negation_agree(n in -10i64..10, bound in -10i64..10) {
        let doc = document(json!({"_id": "x", "n": n})).unwrap();
        let gt = matches(&doc, &json!({"n": {"$gt": bound}})).unwrap();
        let lte = matches(&doc, &json!({"n": {"$lte": bound}})).unwrap();
        let not_gt = matches(&doc, &json!({"n": {"$not": {"$gt": bound}}})).unwrap();
        prop_assert_eq!(gt, n > bound);
        prop_assert_eq!(lte, !gt);
        prop_assert_eq!(not_gt, !gt);
    }
}

// --- Cache Properties ---

proptest! {
    #[test]
    fn prop_pinned_documents_survive_eviction(ops in prop::collection::vec(cache_op(), 0..40)) {
        let cache = DocumentCache::new(Duration::from_secs(1), Some(3));
        let mut pins: HashMap<u8, usize> = HashMap::new();
        let mut must_have: HashSet<u8> = HashSet::new();

        for op in ops {
            match op {
                CacheOp::Set(n) => {
                    cache.set(document(json!({"_id": format!("d{}", n)})).unwrap()).unwrap();
                    if pins.get(&n).copied().unwrap_or(0) > 0 {
                        must_have.insert(n);
                    }
                }
                CacheOp::Pin(n) => {
                    cache.pin(&doc_id(n));
                    *pins.entry(n).or_insert(0) += 1;
                    if cache.has(&doc_id(n)) {
                        must_have.insert(n);
                    }
                }
                CacheOp::Unpin(n) => {
                    cache.unpin(&doc_id(n));
                    let count = pins.entry(n).or_insert(0);
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        must_have.remove(&n);
                    }
                }
            }
            for n in &must_have {
                prop_assert!(cache.has(&doc_id(*n)));
            }
        }

        cache.sweep_at(Instant::now() + Duration::from_secs(7200));
        prop_assert_eq!(cache.len(), must_have.len());
    }
}

// --- Live Result Set Properties ---

fn quiet_registry(bus: Arc<InMemoryBus>) -> SyncRegistry {
    let config = SyncConfig {
        race_detection: RaceDetectionConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    SyncRegistry::new(config, bus).unwrap()
}

fn mirror_callbacks(mirror: &Arc<Mutex<BTreeMap<String, Document>>>) -> ObserveCallbacks {
    let (added, changed, removed) = (mirror.clone(), mirror.clone(), mirror.clone());
    ObserveCallbacks::new()
        .on_added(move |id, doc| {
            added.lock().insert(id.0.clone(), doc);
        })
        .on_changed(move |id, fields| {
            let mut docs = changed.lock();
            let entry = docs.entry(id.0.clone()).or_default();
            for (field, value) in fields {
                entry.insert(field, value);
            }
        })
        .on_removed(move |id| {
            removed.lock().remove(&id.0);
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_observers_mirror_the_store(
        ops in prop::collection::vec(write_op(), 1..25),
        remote in any::<bool>(),
    ) {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let writer_registry = quiet_registry(bus.clone());
        let reader_registry = quiet_registry(bus.clone());
        let writer = writer_registry.collection("docs", store.clone());
        let reader = if remote {
            reader_registry.collection("docs", store.clone())
        } else {
            writer.clone()
        };

        let selector = json!({"v": {"$gte": 5}});
        let mirror = Arc::new(Mutex::new(BTreeMap::new()));
        let _handle = reader
            .observe(selector.clone(), QueryOptions::new(), mirror_callbacks(&mirror))
            .unwrap();

        for op in ops {
            // Duplicate inserts and writes to missing documents fail or no-op.
            let _ = match op {
                WriteOp::Insert(k, v) => writer
                    .insert(document(json!({"_id": format!("d{}", k), "v": v})).unwrap())
                    .map(|_| ()),
                WriteOp::Set(k, v) => writer
                    .update(json!({"_id": format!("d{}", k)}), json!({"$set": {"v": v}}))
                    .map(|_| ()),
                WriteOp::Remove(k) => writer.remove(json!({"_id": format!("d{}", k)})).map(|_| ()),
            };
        }
        writer_registry.flush().unwrap();
        reader_registry.flush().unwrap();

        let expected: BTreeMap<String, Document> = writer
            .fetch(selector, &QueryOptions::new())
            .unwrap()
            .into_iter()
            .map(|doc| (DocId::of(&doc).unwrap().0, doc))
            .collect();
        prop_assert_eq!(&*mirror.lock(), &expected);
    }
}
