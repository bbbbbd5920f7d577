//! Performance benchmarks for live query synchronization.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use livesync::query::matches;
use livesync::{
    document, DocId, DocumentCache, EventKind, InMemoryBus, MemoryStore, MutationEvent,
    ObserveCallbacks, ObserveHandle, QueryOptions, RaceDetectionConfig, SortOrder, SyncConfig,
    SyncRegistry, WireCodec, WireFormat,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn create_registry(bus: Arc<InMemoryBus>) -> SyncRegistry {
    let config = SyncConfig {
        race_detection: RaceDetectionConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    SyncRegistry::new(config, bus).unwrap()
}

/// Benchmark cache hits with varying cache sizes
fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("get_hit", size), &size, |b, &size| {
            let cache = DocumentCache::new(Duration::from_secs(3600), None);
            for i in 0..size {
                cache
                    .set(document(json!({"_id": format!("d{}", i), "n": i})).unwrap())
                    .unwrap();
            }
            let id = DocId::new(format!("d{}", size / 2));
            b.iter(|| {
                black_box(cache.get(&id));
            });
        });
    }

    group.bench_function("set_bounded", |b| {
        let cache = DocumentCache::new(Duration::from_secs(3600), Some(1_000));
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            cache
                .set(document(json!({"_id": format!("d{}", i), "n": i})).unwrap())
                .unwrap();
        });
    });

    group.finish();
}

/// Benchmark selector evaluation
fn bench_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");
    let doc = document(json!({
        "_id": "d1",
        "status": "open",
        "score": 42,
        "tags": ["a", "b", "c"],
        "owner": {"name": "ada", "team": "core"}
    }))
    .unwrap();

    let selectors = [
        ("equality", json!({"status": "open"})),
        ("range", json!({"score": {"$gte": 10, "$lt": 100}})),
        ("array", json!({"tags": {"$in": ["x", "c"]}})),
        ("nested", json!({"owner.team": "core", "status": {"$ne": "closed"}})),
        (
            "compound",
            json!({"$or": [{"score": {"$gt": 50}}, {"tags": "b"}], "owner.name": {"$regex": "^a"}}),
        ),
    ];
    for (name, selector) in &selectors {
        group.bench_with_input(BenchmarkId::new("matches", name), selector, |b, selector| {
            b.iter(|| black_box(matches(&doc, selector).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark event encoding per wire format
fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");
    let event = MutationEvent::new(
        EventKind::Update,
        document(json!({"_id": "d1", "title": "hello", "score": 3, "tags": ["x", "y"]})).unwrap(),
    )
    .with_fields(vec!["title".into(), "score".into()], vec!["draft".into()]);

    for (name, format) in [("msgpack", WireFormat::MessagePack), ("json", WireFormat::Json)] {
        let codec = WireCodec::new(format);
        let payload = codec.encode(&event).unwrap();
        group.bench_function(BenchmarkId::new("encode", name), |b| {
            b.iter(|| black_box(codec.encode(&event).unwrap()));
        });
        group.bench_function(BenchmarkId::new("decode", name), |b| {
            b.iter(|| black_box(codec.decode(&payload).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark an optimistic update routed to many distinct live queries
fn bench_write_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_fanout");

    for queries in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("result_sets", queries),
            &queries,
            |b, &queries| {
                let registry = create_registry(Arc::new(InMemoryBus::new()));
                let items = registry.collection("items", Arc::new(MemoryStore::new()));
                items
                    .insert(document(json!({"_id": "hot", "bucket": 0, "n": 0})).unwrap())
                    .unwrap();
                let _handles: Vec<ObserveHandle> = (0..queries)
                    .map(|bucket| {
                        items
                            .observe(
                                json!({"bucket": bucket}),
                                QueryOptions::new(),
                                ObserveCallbacks::new().on_changed(|_, fields| {
                                    let _ = black_box(fields);
                                }),
                            )
                            .unwrap()
                    })
                    .collect();

                b.iter(|| {
                    items
                        .update(json!({"_id": "hot"}), json!({"$inc": {"n": 1}}))
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark inserts into a full sorted window, which re-run the query
fn bench_window_requery(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_requery");
    group.sample_size(20);

    for docs in [100, 1_000] {
        group.bench_with_input(BenchmarkId::new("collection_size", docs), &docs, |b, &docs| {
            let registry = create_registry(Arc::new(InMemoryBus::new()));
            let items = registry.collection("items", Arc::new(MemoryStore::new()));
            for i in 0..docs {
                items
                    .insert(document(json!({"_id": format!("d{}", i), "score": i})).unwrap())
                    .unwrap();
            }
            let _handle = items
                .observe(
                    json!({}),
                    QueryOptions::new().sort_by("score", SortOrder::Desc).limit(10),
                    ObserveCallbacks::new(),
                )
                .unwrap();

            let mut next = docs;
            b.iter(|| {
                next += 1;
                items
                    .insert(document(json!({"_id": format!("d{}", next), "score": next})).unwrap())
                    .unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache,
    bench_matcher,
    bench_wire_codec,
    bench_write_fanout,
    bench_window_requery,
);

criterion_main!(benches);
