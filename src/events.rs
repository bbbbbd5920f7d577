//! Change events carried between processes.

use crate::types::{DocId, Document, InstanceId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "r")]
    Remove,
    /// Authoritative snapshot replacing whatever a receiver holds.
    #[serde(rename = "fu")]
    ForcedUpdate,
    #[serde(rename = "fr")]
    ForcedRemove,
}

impl EventKind {
    pub fn is_forced(self) -> bool {
        matches!(self, EventKind::ForcedUpdate | EventKind::ForcedRemove)
    }

    pub fn is_removal(self) -> bool {
        matches!(self, EventKind::Remove | EventKind::ForcedRemove)
    }
}

/// A document change as published on the bus.
///
/// Field names on the wire are single letters to keep messages small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    #[serde(rename = "e")]
    pub kind: EventKind,
    /// Full document for inserts and forced updates; `_id` plus changed
    /// field values for updates; `_id` alone for removals.
    #[serde(rename = "d")]
    pub doc: Document,
    /// Changed top-level fields (updates only).
    #[serde(rename = "f", default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Top-level fields the update removed.
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    pub cleared: Vec<String>,
    /// Instance that already applied this event locally.
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<InstanceId>,
}

impl MutationEvent {
    pub fn new(kind: EventKind, doc: Document) -> Self {
        Self {
            kind,
            doc,
            fields: Vec::new(),
            cleared: Vec::new(),
            origin: None,
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>, cleared: Vec<String>) -> Self {
        self.fields = fields;
        self.cleared = cleared;
        self
    }

    pub fn with_origin(mut self, origin: InstanceId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn doc_id(&self) -> Option<DocId> {
        DocId::of(&self.doc)
    }
}
