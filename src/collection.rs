//! Collections: the write path and the entry point for observing.
//!
//! Writes commit to the store first. The change is then mirrored on the
//! cached copy, turned into events and dispatched. A failed write
//! invalidates the cached copies it was about to change.

use crate::cache::{CacheStats, DocumentCache};
use crate::error::{Result, SyncError};
use crate::mutation::MutationOptions;
use crate::observe::{ObserveCallbacks, ObserveHandle};
use crate::query::{
    apply_modifier, apply_upsert_modifier, is_id_only, is_replacement, modifier_top_level_fields,
    normalize_selector, pick_fields, restrict_to_ids, selector_equalities, selector_ids,
    Projection, QueryOptions,
};
use crate::registry::RegistryShared;
use crate::store::{DocumentStore, UpsertOutcome};
use crate::types::{DocId, Document, ID_FIELD};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Store and cache of one collection, shared by its result sets.
pub struct CollectionContext {
    name: String,
    store: Arc<dyn DocumentStore>,
    cache: Arc<DocumentCache>,
    bus_disabled: AtomicBool,
}

impl CollectionContext {
    pub fn new(name: impl Into<String>, store: Arc<dyn DocumentStore>, cache: Arc<DocumentCache>) -> Self {
        Self {
            name: name.into(),
            store,
            cache,
            bus_disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    /// Stop publishing this collection's writes on the bus.
    pub fn disable_bus(&self) {
        self.bus_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_bus_disabled(&self) -> bool {
        self.bus_disabled.load(Ordering::SeqCst)
    }

    /// Documents by id, from the cache where possible. Fetched misses are
    /// cached. Output follows `ids` order; missing documents are skipped.
    pub fn fetch_in_cache_first(&self, ids: &[DocId]) -> Result<Vec<Document>> {
        let mut found: HashMap<DocId, Document> = HashMap::new();
        let mut misses = Vec::new();
        for id in ids {
            match self.cache.get(id) {
                Some(doc) => {
                    found.insert(id.clone(), doc);
                }
                None => misses.push(id.clone()),
            }
        }
        if !misses.is_empty() {
            for doc in self.store.fetch_by_ids(&misses)? {
                if let Some(id) = DocId::of(&doc) {
                    self.cache.set(doc.clone())?;
                    found.insert(id, doc);
                }
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    pub fn fetch_one(&self, id: &DocId) -> Result<Option<Document>> {
        Ok(self
            .fetch_in_cache_first(std::slice::from_ref(id))?
            .into_iter()
            .next())
    }
}

/// Collections known to one registry, by name.
#[derive(Default)]
pub struct CollectionDirectory {
    collections: RwLock<HashMap<String, Arc<CollectionContext>>>,
}

impl CollectionDirectory {
    pub fn get(&self, name: &str) -> Option<Arc<CollectionContext>> {
        self.collections.read().get(name).cloned()
    }

    /// Register a collection. An existing registration under the same name wins.
    pub fn insert(&self, ctx: Arc<CollectionContext>) -> Arc<CollectionContext> {
        self.collections
            .write()
            .entry(ctx.name().to_string())
            .or_insert(ctx)
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<CollectionContext>> {
        self.collections.read().values().cloned().collect()
    }
}

/// Handle on one collection of a [`SyncRegistry`](crate::SyncRegistry).
#[derive(Clone)]
pub struct Collection {
    ctx: Arc<CollectionContext>,
    shared: Arc<RegistryShared>,
}

impl Collection {
    pub(crate) fn new(ctx: Arc<CollectionContext>, shared: Arc<RegistryShared>) -> Self {
        Self { ctx, shared }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn context(&self) -> &Arc<CollectionContext> {
        &self.ctx
    }

    // --- Writes ---

    pub fn insert(&self, doc: Document) -> Result<DocId> {
        self.insert_with(doc, &MutationOptions::default())
    }

    /// Insert a document, generating an `_id` when it has none.
    pub fn insert_with(&self, mut doc: Document, options: &MutationOptions) -> Result<DocId> {
        self.shared.ensure_running()?;
        match doc.get(ID_FIELD) {
            None => {
                doc.insert(ID_FIELD.to_string(), DocId::generate().to_value());
            }
            Some(value) if DocId::from_value(value).is_none() => {
                return Err(SyncError::InvalidOperation(format!("unsupported _id: {}", value)));
            }
            Some(_) => {}
        }
        let id = self.ctx.store().insert(doc.clone())?;
        self.shared.dispatcher.dispatch_insert(&self.ctx, &doc, options)?;
        Ok(id)
    }

    pub fn update(&self, selector: Value, modifier: Value) -> Result<usize> {
        self.update_with(selector, modifier, &MutationOptions::default())
    }

    /// Apply a modifier to the first match, or every match with `multi`.
    /// Returns the number of documents the store modified.
    pub fn update_with(&self, selector: Value, modifier: Value, options: &MutationOptions) -> Result<usize> {
        self.shared.ensure_running()?;
        if options.upsert {
            let outcome = self.upsert_with(selector, modifier, options)?;
            return Ok(outcome.matched + usize::from(outcome.inserted_id.is_some()));
        }
        let selector = normalize_selector(selector)?;
        let before = self.current_documents(&selector, options.multi)?;
        if before.is_empty() {
            return Ok(0);
        }
        let ids: Vec<DocId> = before.iter().filter_map(DocId::of).collect();

        let modified = self
            .ctx
            .store()
            .update(&restrict_to_ids(&selector, &ids), &modifier, options.multi)
            .map_err(|e| self.invalidate(&ids, e))?;
        self.publish_changes(before, &modifier, options)?;
        Ok(modified)
    }

    pub fn upsert(&self, selector: Value, modifier: Value) -> Result<UpsertOutcome> {
        self.upsert_with(selector, modifier, &MutationOptions::default())
    }

    pub fn upsert_with(&self, selector: Value, modifier: Value, options: &MutationOptions) -> Result<UpsertOutcome> {
        self.shared.ensure_running()?;
        let selector = normalize_selector(selector)?;
        let before = self.current_documents(&selector, options.multi)?;
        let ids: Vec<DocId> = before.iter().filter_map(DocId::of).collect();

        let outcome = self
            .ctx
            .store()
            .upsert(&selector, &modifier)
            .map_err(|e| self.invalidate(&ids, e))?;

        match &outcome.inserted_id {
            Some(id) => {
                let doc = match reconstruct_upserted(&selector, &modifier, id) {
                    Some(doc) => Some(doc),
                    None => self.ctx.store().find_authoritative(id)?,
                };
                if let Some(doc) = doc {
                    self.shared.dispatcher.dispatch_insert(&self.ctx, &doc, options)?;
                }
            }
            None => {
                if outcome.matched != before.len() {
                    tracing::warn!(
                        collection = %self.name(),
                        found = before.len(),
                        matched = outcome.matched,
                        "upsert matched a different set than was read, possible race"
                    );
                }
                self.publish_changes(before, &modifier, options)?;
            }
        }
        Ok(outcome)
    }

    pub fn remove(&self, selector: Value) -> Result<usize> {
        self.remove_with(selector, &MutationOptions::default())
    }

    pub fn remove_with(&self, selector: Value, options: &MutationOptions) -> Result<usize> {
        self.shared.ensure_running()?;
        let selector = normalize_selector(selector)?;
        let ids = match selector_ids(&selector) {
            Some(ids) if is_id_only(&selector) => ids,
            _ => self
                .ctx
                .store()
                .query(&selector, &QueryOptions::new().fields(Projection::include([ID_FIELD])))?
                .iter()
                .filter_map(DocId::of)
                .collect(),
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = self
            .ctx
            .store()
            .remove(&restrict_to_ids(&selector, &ids))
            .map_err(|e| self.invalidate(&ids, e))?;
        if removed == 0 {
            return Ok(0);
        }
        for id in &ids {
            self.ctx.cache().delete(id);
            self.shared.dispatcher.dispatch_remove(&self.ctx, id, options)?;
        }
        Ok(removed)
    }

    /// Documents a write is about to change, cache first.
    fn current_documents(&self, selector: &Value, multi: bool) -> Result<Vec<Document>> {
        let mut docs = match selector_ids(selector) {
            Some(ids) if is_id_only(selector) => self.ctx.fetch_in_cache_first(&ids)?,
            _ => {
                let options = if multi {
                    QueryOptions::new()
                } else {
                    QueryOptions::new().limit(1)
                };
                let fetched = self.ctx.store().query(selector, &options)?;
                self.ctx.cache().merge_docs(fetched)
            }
        };
        if !multi {
            docs.truncate(1);
        }
        Ok(docs)
    }

    fn invalidate(&self, ids: &[DocId], error: SyncError) -> SyncError {
        for id in ids {
            self.ctx.cache().delete(id);
        }
        tracing::debug!(collection = %self.name(), count = ids.len(), error = %error, "write failed, cache invalidated");
        error
    }

    /// Mirror a committed modifier on the pre-write documents and dispatch
    /// one update per document that actually changed.
    fn publish_changes(&self, before: Vec<Document>, modifier: &Value, options: &MutationOptions) -> Result<()> {
        let replacement = is_replacement(modifier);
        let touched = modifier_top_level_fields(modifier);
        for original in before {
            let mut after = original.clone();
            apply_modifier(&mut after, modifier)?;
            let diff = self.ctx.store().top_level_diff(&original, &after);
            if diff.is_empty() {
                continue;
            }
            self.ctx.cache().set(after.clone())?;

            let fields: Vec<String> = if replacement {
                diff.updated.clone()
            } else {
                touched
                    .iter()
                    .filter(|f| after.contains_key(f.as_str()) && !diff.cleared.contains(f))
                    .cloned()
                    .collect()
            };
            let payload = pick_fields(&after, &diff_fields(&fields, &diff.cleared));
            self.shared
                .dispatcher
                .dispatch_update(&self.ctx, payload, fields, diff.cleared, options)?;
        }
        Ok(())
    }

    // --- Custom publication ---

    /// Announce a document written to the store through another path.
    pub fn publish_insert(&self, doc: &Document) -> Result<()> {
        self.shared.ensure_running()?;
        self.ctx.cache().set(doc.clone())?;
        self.shared
            .dispatcher
            .dispatch_insert(&self.ctx, doc, &MutationOptions::default())
    }

    /// Announce changed fields of a document. `doc` is its current state;
    /// listed fields absent from it are published as cleared.
    pub fn publish_update(&self, doc: &Document, fields: &[String]) -> Result<()> {
        self.shared.ensure_running()?;
        let (present, cleared): (Vec<String>, Vec<String>) =
            fields.iter().cloned().partition(|f| doc.contains_key(f.as_str()));
        self.ctx.cache().set(doc.clone())?;
        self.shared.dispatcher.dispatch_update(
            &self.ctx,
            pick_fields(doc, fields),
            present,
            cleared,
            &MutationOptions::default(),
        )
    }

    pub fn publish_remove(&self, id: &DocId) -> Result<()> {
        self.shared.ensure_running()?;
        self.ctx.cache().delete(id);
        self.shared
            .dispatcher
            .dispatch_remove(&self.ctx, id, &MutationOptions::default())
    }

    // --- Reads and observation ---

    /// Observe the live result of a query. See [`SyncRegistry`](crate::SyncRegistry).
    pub fn observe(&self, selector: Value, options: QueryOptions, callbacks: ObserveCallbacks) -> Result<ObserveHandle> {
        self.shared.observe(&self.ctx, selector, options, callbacks)
    }

    /// First document matching a selector. Cached documents are scanned
    /// before the store is asked, and a document read from the store is
    /// cached.
    pub fn find_one(&self, selector: Value) -> Result<Option<Document>> {
        let selector = normalize_selector(selector)?;
        if let Some(ids) = selector_ids(&selector).filter(|_| is_id_only(&selector)) {
            return Ok(self.ctx.fetch_in_cache_first(&ids)?.into_iter().next());
        }
        let store = self.ctx.store();
        if let Some(doc) = self
            .ctx
            .cache()
            .find(|doc| store.matches(&selector, doc).unwrap_or(false))
        {
            return Ok(Some(doc));
        }
        let found = store.find_one(&selector)?;
        if let Some(doc) = &found {
            self.ctx.cache().set(doc.clone())?;
        }
        Ok(found)
    }

    pub fn fetch(&self, selector: Value, options: &QueryOptions) -> Result<Vec<Document>> {
        let selector = normalize_selector(selector)?;
        self.ctx.store().query(&selector, options)
    }

    /// Keep a document's cache entry fresh without observing it.
    pub fn watch(&self, id: &DocId) -> Result<()> {
        self.shared.ensure_running()?;
        self.shared.router.add_watch(self.name(), id)
    }

    pub fn unwatch(&self, id: &DocId) -> Result<()> {
        self.shared.router.remove_watch(self.name(), id)
    }

    // --- Settings ---

    pub fn disable_bus(&self) {
        self.ctx.disable_bus();
    }

    /// Fields never considered when detecting conflicting writes.
    pub fn set_race_fields_to_ignore(&self, fields: Vec<String>) {
        self.shared.race.set_fields_to_ignore(self.name(), fields);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache().stats()
    }

    /// Drop every unpinned cache entry. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        self.ctx.cache().clear_unpinned()
    }
}

/// Changed plus cleared fields, without duplicates.
fn diff_fields(fields: &[String], cleared: &[String]) -> Vec<String> {
    let mut all = fields.to_vec();
    all.extend(cleared.iter().filter(|c| !fields.contains(c)).cloned());
    all
}

/// Best guess of an upserted document without reading it back.
fn reconstruct_upserted(selector: &Value, modifier: &Value, id: &DocId) -> Option<Document> {
    let mut doc = selector_equalities(selector);
    doc.insert(ID_FIELD.to_string(), id.to_value());
    apply_upsert_modifier(&mut doc, modifier).ok()?;
    Some(doc)
}
