//! In-process reference store.
//!
//! Documents live in an ordered map keyed by id. A lagging read replica can
//! be simulated with [`MemoryStore::freeze_replica`]: ordinary reads are then
//! served from a frozen snapshot while writes and authoritative reads go to
//! the primary. Failures can be injected for error-path tests.

use super::{DocumentStore, UpsertOutcome};
use crate::error::{Result, SyncError};
use crate::query::{
    apply_modifier, apply_upsert_modifier, matches, selector_equalities, sort_documents,
    QueryOptions,
};
use crate::types::{DocId, Document, ID_FIELD};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type DocMap = BTreeMap<DocId, Document>;

#[derive(Default)]
pub struct MemoryStore {
    primary: RwLock<DocMap>,
    replica: RwLock<Option<DocMap>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve ordinary reads from a snapshot of the current state.
    pub fn freeze_replica(&self) {
        let snapshot = self.primary.read().clone();
        *self.replica.write() = Some(snapshot);
    }

    /// Let the replica catch up with the primary again.
    pub fn sync_replica(&self) {
        *self.replica.write() = None;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of read operations served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.primary.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a document directly, bypassing every notification path.
    pub fn put_raw(&self, doc: Document) -> Result<()> {
        let id = DocId::of(&doc)
            .ok_or_else(|| SyncError::Store("document has no scalar _id".to_string()))?;
        self.primary.write().insert(id, doc);
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Store("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store("injected write failure".to_string()));
        }
        Ok(())
    }

    /// Run `f` against whichever copy ordinary reads should see.
    fn with_readable<R>(&self, f: impl FnOnce(&DocMap) -> R) -> R {
        let replica = self.replica.read();
        match replica.as_ref() {
            Some(snapshot) => f(snapshot),
            None => f(&self.primary.read()),
        }
    }

    fn matching_ids(docs: &DocMap, selector: &Value, first_only: bool) -> Result<Vec<DocId>> {
        let mut ids = Vec::new();
        for (id, doc) in docs {
            if matches(doc, selector)? {
                ids.push(id.clone());
                if first_only {
                    break;
                }
            }
        }
        Ok(ids)
    }
}

impl DocumentStore for MemoryStore {
    fn query(&self, selector: &Value, options: &QueryOptions) -> Result<Vec<Document>> {
        self.check_read()?;
        let mut found = self.with_readable(|docs| -> Result<Vec<Document>> {
            let mut found = Vec::new();
            for doc in docs.values() {
                if matches(doc, selector)? {
                    found.push(doc.clone());
                }
            }
            Ok(found)
        })?;

        if let Some(keys) = &options.sort {
            sort_documents(&mut found, keys);
        }
        let skip = options.skip.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        let page = found.into_iter().skip(skip).take(limit);
        Ok(match &options.fields {
            Some(projection) => page.map(|doc| projection.apply(&doc)).collect(),
            None => page.collect(),
        })
    }

    fn fetch_by_ids(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        self.check_read()?;
        Ok(self.with_readable(|docs| ids.iter().filter_map(|id| docs.get(id).cloned()).collect()))
    }

    fn find_authoritative(&self, id: &DocId) -> Result<Option<Document>> {
        self.check_read()?;
        Ok(self.primary.read().get(id).cloned())
    }

    fn matches(&self, selector: &Value, doc: &Document) -> Result<bool> {
        matches(doc, selector)
    }

    fn insert(&self, mut doc: Document) -> Result<DocId> {
        self.check_write()?;
        let id = match DocId::of(&doc) {
            Some(id) => id,
            None => {
                let id = DocId::generate();
                doc.insert(ID_FIELD.to_string(), id.to_value());
                id
            }
        };
        let mut primary = self.primary.write();
        if primary.contains_key(&id) {
            return Err(SyncError::Store(format!("duplicate key: {}", id)));
        }
        primary.insert(id.clone(), doc);
        Ok(id)
    }

    fn update(&self, selector: &Value, modifier: &Value, multi: bool) -> Result<usize> {
        self.check_write()?;
        let mut primary = self.primary.write();
        let ids = Self::matching_ids(&primary, selector, !multi)?;

        // Apply to copies first so a bad modifier leaves the store untouched.
        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(doc) = primary.get(id) {
                let mut next = doc.clone();
                apply_modifier(&mut next, modifier)?;
                updated.push((id.clone(), next));
            }
        }
        let count = updated.len();
        for (id, doc) in updated {
            primary.insert(id, doc);
        }
        Ok(count)
    }

    fn upsert(&self, selector: &Value, modifier: &Value) -> Result<UpsertOutcome> {
        self.check_write()?;
        let mut primary = self.primary.write();
        let ids = Self::matching_ids(&primary, selector, true)?;

        if let Some(id) = ids.first() {
            if let Some(doc) = primary.get(id) {
                let mut next = doc.clone();
                apply_modifier(&mut next, modifier)?;
                primary.insert(id.clone(), next);
            }
            return Ok(UpsertOutcome {
                inserted_id: None,
                matched: 1,
            });
        }

        let mut doc = selector_equalities(selector);
        apply_upsert_modifier(&mut doc, modifier)?;
        let id = match DocId::of(&doc) {
            Some(id) => id,
            None => {
                let id = DocId::generate();
                doc.insert(ID_FIELD.to_string(), id.to_value());
                id
            }
        };
        primary.insert(id.clone(), doc);
        Ok(UpsertOutcome {
            inserted_id: Some(id),
            matched: 0,
        })
    }

    fn remove(&self, selector: &Value) -> Result<usize> {
        self.check_write()?;
        let mut primary = self.primary.write();
        let ids = Self::matching_ids(&primary, selector, false)?;
        for id in &ids {
            primary.remove(id);
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Projection, SortOrder};
    use crate::types::document;
    use serde_json::json;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (id, v) in [("a", 3), ("b", 1), ("c", 2)] {
            store
                .insert(document(json!({"_id": id, "v": v, "kind": "n"})).unwrap())
                .unwrap();
        }
        store
    }

    #[test]
    fn test_query_sort_skip_limit_fields() {
        let store = seeded();
        let options = QueryOptions::new()
            .sort_by("v", SortOrder::Asc)
            .skip(1)
            .limit(1)
            .fields(Projection::include(["v"]));
        let docs = store.query(&json!({}), &options).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(Value::Object(docs[0].clone()), json!({"_id": "c", "v": 2}));
    }

    #[test]
    fn test_insert_generates_id_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let id = store.insert(document(json!({"x": 1})).unwrap()).unwrap();
        assert_eq!(store.fetch_by_ids(&[id.clone()]).unwrap().len(), 1);

        let dup = document(json!({"_id": id.0, "x": 2})).unwrap();
        assert!(store.insert(dup).is_err());
    }

    #[test]
    fn test_update_single_and_multi() {
        let store = seeded();
        let one = store.update(&json!({"kind": "n"}), &json!({"$inc": {"v": 10}}), false).unwrap();
        assert_eq!(one, 1);
        let all = store.update(&json!({"kind": "n"}), &json!({"$set": {"seen": true}}), true).unwrap();
        assert_eq!(all, 3);
        let a = store.find_one(&json!({"_id": "a"})).unwrap().unwrap();
        assert_eq!(a["v"], json!(13));
        assert_eq!(a["seen"], json!(true));
    }

    #[test]
    fn test_bad_modifier_leaves_store_untouched() {
        let store = seeded();
        let result = store.update(&json!({}), &json!({"$set": {"v": 0}, "$inc": {"kind": 1}}), true);
        assert!(result.is_err());
        assert_eq!(store.find_one(&json!({"_id": "b"})).unwrap().unwrap()["v"], json!(1));
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let store = MemoryStore::new();
        let first = store
            .upsert(&json!({"name": "x"}), &json!({"$set": {"v": 1}}))
            .unwrap();
        let id = first.inserted_id.clone().unwrap();
        let doc = store.find_authoritative(&id).unwrap().unwrap();
        assert_eq!(doc["name"], json!("x"));
        assert_eq!(doc["v"], json!(1));

        let second = store
            .upsert(&json!({"name": "x"}), &json!({"$set": {"v": 2}}))
            .unwrap();
        assert_eq!(second, UpsertOutcome { inserted_id: None, matched: 1 });
    }

    #[test]
    fn test_remove() {
        let store = seeded();
        assert_eq!(store.remove(&json!({"v": {"$gte": 2}})).unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_frozen_replica_lags_primary() {
        let store = seeded();
        store.freeze_replica();
        store.update(&json!({"_id": "a"}), &json!({"$set": {"v": 100}}), false).unwrap();

        let stale = store.fetch_by_ids(&[DocId::new("a")]).unwrap();
        assert_eq!(stale[0]["v"], json!(3));
        let fresh = store.find_authoritative(&DocId::new("a")).unwrap().unwrap();
        assert_eq!(fresh["v"], json!(100));

        store.sync_replica();
        assert_eq!(store.fetch_by_ids(&[DocId::new("a")]).unwrap()[0]["v"], json!(100));
    }

    #[test]
    fn test_injected_failures() {
        let store = seeded();
        store.fail_writes(true);
        assert!(matches!(
            store.remove(&json!({})),
            Err(SyncError::Store(_))
        ));
        store.fail_writes(false);
        store.fail_reads(true);
        assert!(store.query(&json!({}), &QueryOptions::new()).is_err());
    }
}
