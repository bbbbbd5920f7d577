//! Detection of near-simultaneous conflicting mutations.
//!
//! Every mutation seen for a document is recorded with the values it wrote
//! to each top-level field. When a later mutation within the window writes a
//! different value to a field already touched (or removes a document whose
//! fields were just written, or vice versa), the merged state a receiver
//! derived may be wrong. A correction is then scheduled after a short random
//! delay; it re-reads the document from the authoritative source and
//! broadcasts it as a forced event. A forced event for the same document
//! arriving first from another process cancels the local correction.

use crate::config::RaceDetectionConfig;
use crate::timer::{TimerId, TimerService};
use crate::types::{DocId, Document, ID_FIELD};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// What a mutation did to a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Touch {
    /// New value per top-level field; `None` when the field was cleared.
    Fields(HashMap<String, Option<Value>>),
    Removed,
}

impl Touch {
    /// Touch for the given fields, reading values from `doc`.
    pub fn from_doc(doc: &Document, fields: &[String], cleared: &[String]) -> Self {
        let mut touched = HashMap::new();
        for field in fields {
            if field != ID_FIELD {
                touched.insert(field.clone(), doc.get(field).cloned());
            }
        }
        for field in cleared {
            touched.insert(field.clone(), None);
        }
        Touch::Fields(touched)
    }

    /// Touch covering every field of a freshly inserted document.
    pub fn inserted(doc: &Document) -> Self {
        Touch::Fields(
            doc.iter()
                .filter(|(k, _)| k.as_str() != ID_FIELD)
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
        )
    }
}

/// Invoked when a correction timer fires: `(collection, id)`.
pub type Corrector = Arc<dyn Fn(&str, &DocId) + Send + Sync>;

struct RaceEntry {
    touched: HashMap<String, Option<Value>>,
    removed: bool,
    touched_at: Instant,
    timer: Option<TimerId>,
}

impl RaceEntry {
    fn new(touch: Touch) -> Self {
        let mut entry = RaceEntry {
            touched: HashMap::new(),
            removed: false,
            touched_at: Instant::now(),
            timer: None,
        };
        entry.merge(touch);
        entry
    }

    fn merge(&mut self, touch: Touch) {
        match touch {
            Touch::Fields(fields) => self.touched.extend(fields),
            Touch::Removed => self.removed = true,
        }
        self.touched_at = Instant::now();
    }

    /// Fields whose values collide with `touch`, or a removal conflict.
    fn collisions(&self, touch: &Touch, ignored: Option<&HashSet<String>>) -> Vec<String> {
        let is_ignored = |f: &str| ignored.map(|set| set.contains(f)).unwrap_or(false);
        match touch {
            Touch::Removed => {
                if self.removed {
                    return Vec::new();
                }
                let fields: Vec<String> = self
                    .touched
                    .keys()
                    .filter(|f| !is_ignored(f.as_str()))
                    .cloned()
                    .collect();
                if fields.is_empty() {
                    vec!["<removed>".to_string()]
                } else {
                    fields
                }
            }
            Touch::Fields(fields) => {
                if self.removed {
                    return vec!["<removed>".to_string()];
                }
                fields
                    .iter()
                    .filter(|(f, _)| !is_ignored(f.as_str()))
                    .filter(|(f, value)| match self.touched.get(*f) {
                        Some(previous) => previous != *value,
                        None => false,
                    })
                    .map(|(f, _)| f.clone())
                    .collect()
            }
        }
    }
}

type HistoryKey = (String, DocId);

pub struct RaceDetector {
    config: RaceDetectionConfig,
    history: Mutex<HashMap<HistoryKey, RaceEntry>>,
    ignored: RwLock<HashMap<String, HashSet<String>>>,
    timers: Arc<TimerService>,
    corrector: RwLock<Option<Corrector>>,
    self_ref: Weak<RaceDetector>,
}

impl RaceDetector {
    pub fn new(config: RaceDetectionConfig, timers: Arc<TimerService>) -> Arc<Self> {
        let ignored = config
            .fields_to_ignore
            .iter()
            .map(|(coll, fields)| (coll.clone(), fields.iter().cloned().collect()))
            .collect();
        Arc::new_cyclic(|self_ref| Self {
            config,
            history: Mutex::new(HashMap::new()),
            ignored: RwLock::new(ignored),
            timers,
            corrector: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn set_corrector(&self, corrector: Corrector) {
        *self.corrector.write() = Some(corrector);
    }

    pub fn set_fields_to_ignore(&self, collection: &str, fields: Vec<String>) {
        self.ignored
            .write()
            .insert(collection.to_string(), fields.into_iter().collect());
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Record a mutation. Returns true if a correction was scheduled.
    pub fn on_mutation(&self, collection: &str, id: &DocId, touch: Touch) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = (collection.to_string(), id.clone());
        let mut history = self.history.lock();

        if !history.contains_key(&key) {
            history.insert(key, RaceEntry::new(touch));
            return false;
        }
        let Some(entry) = history.get_mut(&key) else {
            return false;
        };

        if entry.timer.is_some() {
            // A correction is already on its way.
            return false;
        }
        if entry.touched_at.elapsed() > self.config.window {
            *entry = RaceEntry::new(touch);
            return false;
        }

        let ignored = self.ignored.read();
        let collisions = entry.collisions(&touch, ignored.get(collection));
        drop(ignored);

        if collisions.is_empty() {
            entry.merge(touch);
            return false;
        }

        let delay = self.correction_delay();
        tracing::info!(
            collection,
            id = %id,
            fields = ?collisions,
            delay_ms = delay.as_millis() as u64,
            "possible race condition, scheduling correction"
        );
        entry.timer = Some(self.schedule_correction(collection, id, delay));
        true
    }

    /// A forced event arrived: whatever correction we planned already happened.
    pub fn on_force(&self, collection: &str, id: &DocId) {
        let key = (collection.to_string(), id.clone());
        if let Some(entry) = self.history.lock().remove(&key) {
            if let Some(timer) = entry.timer {
                tracing::debug!(collection, id = %id, "correction superseded by forced event");
                self.timers.cancel(timer);
            }
        }
    }

    pub fn has_pending_correction(&self, collection: &str, id: &DocId) -> bool {
        self.history
            .lock()
            .get(&(collection.to_string(), id.clone()))
            .map(|e| e.timer.is_some())
            .unwrap_or(false)
    }

    pub fn tracked(&self) -> usize {
        self.history.lock().len()
    }

    /// Drop entries older than the window that have no pending correction.
    pub fn gc(&self) -> usize {
        let window = self.config.window;
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|_, entry| entry.timer.is_some() || entry.touched_at.elapsed() <= window);
        before - history.len()
    }

    fn correction_delay(&self) -> Duration {
        let min = self.config.correction_delay_min.as_millis() as u64;
        let max = self.config.correction_delay_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    fn schedule_correction(&self, collection: &str, id: &DocId, delay: Duration) -> TimerId {
        let detector = self.self_ref.clone();
        let collection = collection.to_string();
        let id = id.clone();
        self.timers.schedule(delay, move || {
            if let Some(detector) = detector.upgrade() {
                detector.fire(&collection, &id);
            }
        })
    }

    fn fire(&self, collection: &str, id: &DocId) {
        let key = (collection.to_string(), id.clone());
        let pending = self
            .history
            .lock()
            .remove(&key)
            .map(|e| e.timer.is_some())
            .unwrap_or(false);
        if !pending {
            return;
        }
        let corrector = self.corrector.read().clone();
        match corrector {
            Some(correct) => correct(collection, id),
            None => tracing::warn!(collection, id = %id, "no corrector installed"),
        }
    }
}
