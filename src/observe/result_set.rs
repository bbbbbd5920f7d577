//! The live set of documents matching one query.
//!
//! A result set owns the `id -> version marker` map of what it has delivered
//! and turns store reads into multiplexer events. Re-synchronization is built
//! on [`reconcile`], which splits tracked and freshly queried ids into
//! `both`, `left_only` (tracked, gone from the store) and `right_only` (new
//! in the store).

use super::multiplexer::{ChangeKind, ResultSetMultiplexer};
use super::Delivery;
use crate::collection::CollectionContext;
use crate::error::{Result, SyncError};
use crate::events::EventKind;
use crate::query::{is_id_only, pick_fields, selector_ids, QueryOptions};
use crate::types::{DocId, Document, VersionMarker};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Split of tracked versus freshly queried ids, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub both: Vec<DocId>,
    pub left_only: Vec<DocId>,
    pub right_only: Vec<DocId>,
}

impl Reconciliation {
    pub fn is_settled(&self) -> bool {
        self.left_only.is_empty() && self.right_only.is_empty()
    }
}

/// Compare tracked ids with a fresh `id -> marker` snapshot. One pass over
/// each map.
pub fn reconcile<V>(
    tracked: &HashMap<DocId, VersionMarker>,
    fresh: &HashMap<DocId, V>,
) -> Reconciliation {
    let mut out = Reconciliation::default();
    for id in tracked.keys() {
        if fresh.contains_key(id) {
            out.both.push(id.clone());
        } else {
            out.left_only.push(id.clone());
        }
    }
    out.right_only = fresh
        .keys()
        .filter(|id| !tracked.contains_key(*id))
        .cloned()
        .collect();
    out
}

pub struct ObservableResultSet {
    collection: Arc<CollectionContext>,
    selector: Value,
    options: QueryOptions,
    tracked: Mutex<HashMap<DocId, VersionMarker>>,
    initialized: AtomicBool,
    mux: Arc<ResultSetMultiplexer>,
}

impl ObservableResultSet {
    pub fn new(
        collection: Arc<CollectionContext>,
        selector: Value,
        options: QueryOptions,
        mux: Arc<ResultSetMultiplexer>,
    ) -> Self {
        Self {
            collection,
            selector,
            options,
            tracked: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            mux,
        }
    }

    pub fn selector(&self) -> &Value {
        &self.selector
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn multiplexer(&self) -> &Arc<ResultSetMultiplexer> {
        &self.mux
    }

    pub fn collection(&self) -> &Arc<CollectionContext> {
        &self.collection
    }

    /// Run the initial query, add every match and signal ready.
    ///
    /// A failure is reported to the multiplexer, which fails every waiting
    /// observer with it. Calling `init` again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let docs = match self.initial_documents() {
            Ok(docs) => docs,
            Err(e) => {
                self.mux.query_error(&e);
                return Err(e);
            }
        };
        tracing::debug!(
            collection = %self.collection.name(),
            count = docs.len(),
            "initial query complete"
        );
        for doc in docs {
            self.add(doc, Delivery::Queued)?;
        }
        self.mux.ready()
    }

    fn initial_documents(&self) -> Result<Vec<Document>> {
        if is_id_only(&self.selector) && self.options.skip.is_none() && self.options.limit.is_none() {
            let ids = selector_ids(&self.selector).unwrap_or_default();
            return self.collection.fetch_in_cache_first(&ids);
        }
        let docs = self
            .collection
            .store()
            .query(&self.selector, &self.options.unprojected())?;
        Ok(self.collection.cache().merge_docs(docs))
    }

    // --- Membership ---

    pub fn contains(&self, id: &DocId) -> bool {
        self.tracked.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.lock().is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether a document satisfies this result set's selector.
    pub fn is_eligible(&self, doc: &Document) -> Result<bool> {
        self.collection.store().matches(&self.selector, doc)
    }

    pub fn is_limit_reached(&self) -> bool {
        match self.options.limit {
            Some(limit) => self.len() >= limit,
            None => false,
        }
    }

    // --- Actions ---

    pub fn add(&self, doc: Document, mode: Delivery) -> Result<()> {
        let id = DocId::of(&doc)
            .ok_or_else(|| SyncError::InvalidOperation("document without _id".to_string()))?;
        {
            let mut tracked = self.tracked.lock();
            if tracked.contains_key(&id) {
                return Ok(());
            }
            tracked.insert(id.clone(), VersionMarker::of_or_now(&doc));
        }
        self.mux.apply(ChangeKind::Added, id, Some(doc), mode)
    }

    pub fn add_by_id(&self, id: &DocId, mode: Delivery) -> Result<()> {
        match self.collection.fetch_one(id)? {
            Some(doc) => self.add(doc, mode),
            None => Ok(()),
        }
    }

    /// Deliver a change. `fields` limits the payload to those top-level
    /// fields; `None` sends the whole document.
    pub fn change(&self, doc: Document, fields: Option<&[String]>, mode: Delivery) -> Result<()> {
        let id = DocId::of(&doc)
            .ok_or_else(|| SyncError::InvalidOperation("document without _id".to_string()))?;
        {
            let mut tracked = self.tracked.lock();
            match tracked.get_mut(&id) {
                Some(version) => *version = VersionMarker::of_or_now(&doc),
                None => return Ok(()),
            }
        }
        let payload = match fields {
            Some(fields) => pick_fields(&doc, fields),
            None => doc,
        };
        self.mux.apply(ChangeKind::Changed, id, Some(payload), mode)
    }

    pub fn change_by_id(&self, id: &DocId, fields: Option<&[String]>, mode: Delivery) -> Result<()> {
        match self.collection.fetch_one(id)? {
            Some(doc) => self.change(doc, fields, mode),
            None => Ok(()),
        }
    }

    pub fn remove(&self, id: &DocId, mode: Delivery) -> Result<()> {
        if self.tracked.lock().remove(id).is_none() {
            return Ok(());
        }
        self.mux.apply(ChangeKind::Removed, id.clone(), None, mode)
    }

    // --- Re-synchronization ---

    /// Compare tracked ids with a fresh snapshot of the query's matches.
    pub fn compare_with<V>(&self, fresh: &HashMap<DocId, V>) -> Reconciliation {
        reconcile(&self.tracked.lock(), fresh)
    }

    fn fresh_versions(&self) -> Result<HashMap<DocId, Option<VersionMarker>>> {
        let docs = self
            .collection
            .store()
            .query(&self.selector, &self.options.version_query())?;
        Ok(docs
            .iter()
            .filter_map(|doc| DocId::of(doc).map(|id| (id, VersionMarker::of(doc))))
            .collect())
    }

    /// Re-run the query and converge on its current matches.
    ///
    /// A `newcomer` is the document that triggered the requery; it is added
    /// directly instead of being fetched again, and for an update it receives
    /// a change when it stays in the set.
    pub fn requery(
        &self,
        newcomer: Option<&Document>,
        event: Option<EventKind>,
        fields: Option<&[String]>,
        mode: Delivery,
    ) -> Result<()> {
        let fresh = self.fresh_versions()?;
        let rec = self.compare_with(&fresh);
        let newcomer_id = newcomer.and_then(DocId::of);

        for id in &rec.left_only {
            self.remove(id, mode)?;
        }
        let mut newcomer_added = false;
        for id in &rec.right_only {
            match newcomer {
                Some(doc) if newcomer_id.as_ref() == Some(id) => {
                    self.add(doc.clone(), mode)?;
                    newcomer_added = true;
                }
                _ => self.add_by_id(id, mode)?,
            }
        }

        let is_update = matches!(event, Some(EventKind::Update) | Some(EventKind::ForcedUpdate));
        if let (true, false, Some(doc), Some(id)) = (is_update, newcomer_added, newcomer, &newcomer_id) {
            if self.contains(id) {
                self.change(doc.clone(), fields, mode)?;
            }
        }
        Ok(())
    }

    /// Common ids whose fresh marker is newer than the tracked one. A fresh
    /// document without a marker may have changed.
    fn possibly_changed(
        &self,
        both: &[DocId],
        fresh: &HashMap<DocId, Option<VersionMarker>>,
    ) -> Vec<DocId> {
        let tracked = self.tracked.lock();
        both.iter()
            .filter(|id| match (fresh.get(*id), tracked.get(*id)) {
                (Some(Some(newer)), Some(known)) => newer > known,
                _ => true,
            })
            .cloned()
            .collect()
    }

    /// Converge on the store after events may have been missed.
    pub fn reload(&self, mode: Delivery) -> Result<()> {
        let fresh = self.fresh_versions()?;
        let rec = self.compare_with(&fresh);
        tracing::debug!(
            collection = %self.collection.name(),
            both = rec.both.len(),
            gone = rec.left_only.len(),
            new = rec.right_only.len(),
            "reloading result set"
        );
        for id in self.possibly_changed(&rec.both, &fresh) {
            self.change_by_id(&id, None, mode)?;
        }
        for id in &rec.left_only {
            self.remove(id, mode)?;
        }
        for id in &rec.right_only {
            self.add_by_id(id, mode)?;
        }
        Ok(())
    }
}
