//! Backing document store interface.
//!
//! The store is an external collaborator. Result sets read through it, the
//! collection write path commits through it, and race corrections read
//! authoritative state from it.

pub mod memory;

use crate::diff::{top_level_diff, FieldDiff};
use crate::error::Result;
use crate::query::QueryOptions;
use crate::types::{DocId, Document};
use serde_json::{json, Value};

pub use memory::MemoryStore;

/// Outcome of an upsert against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Id of the inserted document, when nothing matched.
    pub inserted_id: Option<DocId>,
    /// Documents modified when something matched.
    pub matched: usize,
}

pub trait DocumentStore: Send + Sync {
    /// Run a query, honoring sort, skip, limit and field projection.
    fn query(&self, selector: &Value, options: &QueryOptions) -> Result<Vec<Document>>;

    /// Fetch documents by id. Missing ids are skipped.
    fn fetch_by_ids(&self, ids: &[DocId]) -> Result<Vec<Document>>;

    fn find_one(&self, selector: &Value) -> Result<Option<Document>> {
        Ok(self
            .query(selector, &QueryOptions::new().limit(1))?
            .into_iter()
            .next())
    }

    /// Read bypassing replicas and caches.
    fn find_authoritative(&self, id: &DocId) -> Result<Option<Document>> {
        Ok(self.fetch_by_ids(std::slice::from_ref(id))?.into_iter().next())
    }

    /// Whether a document satisfies a selector.
    fn matches(&self, selector: &Value, doc: &Document) -> Result<bool>;

    fn insert(&self, doc: Document) -> Result<DocId>;

    /// Apply a modifier to the first (or every, with `multi`) match.
    /// Returns the number of documents modified.
    fn update(&self, selector: &Value, modifier: &Value, multi: bool) -> Result<usize>;

    fn upsert(&self, selector: &Value, modifier: &Value) -> Result<UpsertOutcome>;

    /// Remove every match. Returns the number removed.
    fn remove(&self, selector: &Value) -> Result<usize>;

    fn top_level_diff(&self, before: &Document, after: &Document) -> FieldDiff {
        top_level_diff(before, after)
    }
}

/// Selector matching exactly the given ids.
pub fn ids_selector(ids: &[DocId]) -> Value {
    let list: Vec<Value> = ids.iter().map(DocId::to_value).collect();
    json!({ "_id": { "$in": list } })
}
