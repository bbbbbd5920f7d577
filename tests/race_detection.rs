//! Conflicting writes from two processes and the corrections that repair
//! them.

use livesync::{
    document, Collection, DocId, Document, EventKind, InMemoryBus, MemoryStore, ObserveCallbacks, ObserveHandle,
    QueryOptions, RaceDetectionConfig, SyncConfig, SyncRegistry, WireCodec, WireFormat,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn race_config(enabled: bool) -> SyncConfig {
    SyncConfig {
        race_detection: RaceDetectionConfig {
            enabled,
            window: Duration::from_secs(5),
            correction_delay_min: Duration::from_millis(5),
            correction_delay_max: Duration::from_millis(20),
            fields_to_ignore: HashMap::new(),
        },
        ..Default::default()
    }
}

fn doc(value: Value) -> Document {
    document(value).unwrap()
}

/// Poll until `condition` holds or two seconds pass.
fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[derive(Clone, Default)]
struct Mirror {
    docs: Arc<Mutex<BTreeMap<String, Document>>>,
}

impl Mirror {
    fn callbacks(&self) -> ObserveCallbacks {
        let added = self.docs.clone();
        let changed = self.docs.clone();
        let removed = self.docs.clone();
        ObserveCallbacks::new()
            .on_added(move |id, doc| {
                added.lock().insert(id.0.clone(), doc);
            })
            .on_changed(move |id, fields| {
                let mut docs = changed.lock();
                let entry = docs.entry(id.0.clone()).or_default();
                for (field, value) in fields {
                    if value.is_null() {
                        entry.remove(&field);
                    } else {
                        entry.insert(field, value);
                    }
                }
            })
            .on_removed(move |id| {
                removed.lock().remove(&id.0);
            })
    }

    fn field(&self, id: &str, field: &str) -> Option<Value> {
        self.docs.lock().get(id).and_then(|d| d.get(field).cloned())
    }
}

struct Pair {
    bus: Arc<InMemoryBus>,
    store: Arc<MemoryStore>,
    a: SyncRegistry,
    b: SyncRegistry,
    items_a: Collection,
    items_b: Collection,
    mirror_a: Mirror,
    mirror_b: Mirror,
    _handles: Vec<ObserveHandle>,
}

/// Two processes observing one seeded document. The seed bypasses the
/// registries so no write history exists yet.
fn pair(config: SyncConfig) -> Pair {
    pair_with(config.clone(), config)
}

fn pair_with(config_a: SyncConfig, config_b: SyncConfig) -> Pair {
    init_tracing();
    let bus = Arc::new(InMemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    store.put_raw(doc(json!({"_id": "i1", "x": 0, "y": 0}))).unwrap();

    let a = SyncRegistry::new(config_a, bus.clone()).unwrap();
    let b = SyncRegistry::new(config_b, bus.clone()).unwrap();
    let items_a = a.collection("items", store.clone());
    let items_b = b.collection("items", store.clone());
    let (mirror_a, mirror_b) = (Mirror::default(), Mirror::default());
    let handles = vec![
        items_a
            .observe(json!({}), QueryOptions::new(), mirror_a.callbacks())
            .unwrap(),
        items_b
            .observe(json!({}), QueryOptions::new(), mirror_b.callbacks())
            .unwrap(),
    ];
    Pair {
        bus,
        store,
        a,
        b,
        items_a,
        items_b,
        mirror_a,
        mirror_b,
        _handles: handles,
    }
}

/// Both processes write before either sees the other's event.
fn concurrent_sets(pair: &Pair, field: &str, a_value: Value, b_value: Value) {
    pair.bus.hold();
    pair.items_a
        .update(json!({"_id": "i1"}), json!({"$set": {field: a_value}}))
        .unwrap();
    pair.items_b
        .update(json!({"_id": "i1"}), json!({"$set": {field: b_value}}))
        .unwrap();
    pair.bus.release();
    pair.a.flush().unwrap();
    pair.b.flush().unwrap();
}

fn id() -> DocId {
    DocId::new("i1")
}

// --- Collision Tests ---

#[test]
fn test_conflicting_writes_converge_on_stored_value() {
    let pair = pair(race_config(true));
    concurrent_sets(&pair, "x", json!(1), json!(2));

    // Each process saw the other's older write last, until corrected.
    assert!(wait_until(|| {
        pair.mirror_a.field("i1", "x") == Some(json!(2))
            && pair.mirror_b.field("i1", "x") == Some(json!(2))
    }));
    assert!(wait_until(|| {
        !pair.a.race_detector().has_pending_correction("items", &id())
            && !pair.b.race_detector().has_pending_correction("items", &id())
    }));
}

fn with_correction_delay(delay: Duration) -> SyncConfig {
    let mut config = race_config(true);
    config.race_detection.correction_delay_min = delay;
    config.race_detection.correction_delay_max = delay;
    config
}

#[test]
fn test_collision_publishes_a_single_correction() {
    let pair = pair_with(
        with_correction_delay(Duration::from_millis(20)),
        with_correction_delay(Duration::from_millis(300)),
    );
    let started = Instant::now();
    concurrent_sets(&pair, "x", json!(1), json!(2));
    assert!(pair.b.race_detector().has_pending_correction("items", &id()));

    assert!(wait_until(|| {
        !pair.a.race_detector().has_pending_correction("items", &id())
            && !pair.b.race_detector().has_pending_correction("items", &id())
    }));
    // Past the moment B's own timer would have fired.
    if let Some(rest) = Duration::from_millis(450).checked_sub(started.elapsed()) {
        thread::sleep(rest);
    }

    let codec = WireCodec::new(WireFormat::default());
    let forced = pair
        .bus
        .published()
        .into_iter()
        .filter(|(channel, _)| channel == "items")
        .filter(|(_, payload)| codec.decode(payload).unwrap().kind == EventKind::ForcedUpdate)
        .count();
    assert_eq!(forced, 1);
    assert_eq!(pair.mirror_a.field("i1", "x"), Some(json!(2)));
    assert_eq!(pair.mirror_b.field("i1", "x"), Some(json!(2)));
}

#[test]
fn test_without_detection_last_delivered_write_wins_locally() {
    let pair = pair(race_config(false));
    concurrent_sets(&pair, "x", json!(1), json!(2));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(pair.mirror_a.field("i1", "x"), Some(json!(2)));
    // B applied A's older write last and has no way to notice.
    assert_eq!(pair.mirror_b.field("i1", "x"), Some(json!(1)));
    assert_eq!(pair.b.race_detector().tracked(), 0);
}

#[test]
fn test_identical_values_do_not_collide() {
    let pair = pair(race_config(true));
    concurrent_sets(&pair, "x", json!(7), json!(7));

    assert!(!pair.a.race_detector().has_pending_correction("items", &id()));
    assert!(!pair.b.race_detector().has_pending_correction("items", &id()));
    assert_eq!(pair.mirror_b.field("i1", "x"), Some(json!(7)));
}

#[test]
fn test_disjoint_fields_do_not_collide() {
    let pair = pair(race_config(true));
    pair.bus.hold();
    pair.items_a
        .update(json!({"_id": "i1"}), json!({"$set": {"x": 1}}))
        .unwrap();
    pair.items_b
        .update(json!({"_id": "i1"}), json!({"$set": {"y": 1}}))
        .unwrap();
    pair.bus.release();

    assert!(!pair.a.race_detector().has_pending_correction("items", &id()));
    assert!(!pair.b.race_detector().has_pending_correction("items", &id()));
}

#[test]
fn test_ignored_fields_do_not_collide() {
    let pair = pair(race_config(true));
    pair.items_a.set_race_fields_to_ignore(vec!["x".to_string()]);
    pair.items_b.set_race_fields_to_ignore(vec!["x".to_string()]);
    concurrent_sets(&pair, "x", json!(1), json!(2));

    assert!(!pair.a.race_detector().has_pending_correction("items", &id()));
    assert!(!pair.b.race_detector().has_pending_correction("items", &id()));
}

// --- Correction Tests ---

#[test]
fn test_correction_reads_primary_when_replica_lags() {
    let pair = pair(race_config(true));
    pair.store.freeze_replica();
    concurrent_sets(&pair, "x", json!(1), json!(2));

    assert!(wait_until(|| pair.mirror_b.field("i1", "x") == Some(json!(2))));
    pair.store.sync_replica();
}

#[test]
fn test_concurrent_remove_corrects_to_removal() {
    let pair = pair(race_config(true));
    pair.bus.hold();
    pair.items_a
        .update(json!({"_id": "i1"}), json!({"$set": {"x": 1}}))
        .unwrap();
    pair.items_b.remove(json!({"_id": "i1"})).unwrap();
    pair.bus.release();
    pair.a.flush().unwrap();
    pair.b.flush().unwrap();

    assert!(wait_until(|| {
        pair.mirror_a.field("i1", "x").is_none() && pair.mirror_b.field("i1", "x").is_none()
    }));
    assert!(pair.store.is_empty());
}

#[test]
fn test_shutdown_cancels_pending_corrections() {
    let mut config = race_config(true);
    config.race_detection.correction_delay_min = Duration::from_millis(200);
    config.race_detection.correction_delay_max = Duration::from_millis(200);
    let pair = pair(config);
    concurrent_sets(&pair, "x", json!(1), json!(2));

    let published = pair.bus.published().len();
    pair.a.shutdown();
    pair.b.shutdown();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(pair.bus.published().len(), published);
}
