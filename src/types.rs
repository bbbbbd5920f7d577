//! Core types shared by the cache, the router and the observers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A stored document. Always a JSON object carrying a string `_id`.
pub type Document = Map<String, Value>;

/// Name of the identity field on every document.
pub const ID_FIELD: &str = "_id";

/// Name of the field read as a document's version marker.
pub const VERSION_FIELD: &str = "updatedAt";

/// Identifier of a stored document, as a string key.
///
/// String ids are kept as they are, except that ids starting with `-`, `~`
/// or `{` gain a `-` prefix. Numeric and boolean ids become `~` followed by
/// their JSON text, so `_id: 1` is keyed `~1`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }

    /// Generate a fresh random id for a document inserted without one.
    pub fn generate() -> Self {
        DocId(hex::encode(rand::random::<[u8; 12]>()))
    }

    /// Read the id of a document, if it has a scalar `_id`.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get(ID_FIELD).and_then(Self::from_value)
    }

    /// Key of an `_id` value. Null, arrays and objects have none.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s.starts_with(['-', '~', '{']) => Some(DocId(format!("-{}", s))),
            Value::String(s) => Some(DocId(s.clone())),
            Value::Number(_) | Value::Bool(_) => Some(DocId(format!("~{}", value))),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The `_id` value this key stands for.
    pub fn to_value(&self) -> Value {
        if let Some(raw) = self.0.strip_prefix('-') {
            return Value::String(raw.to_string());
        }
        if let Some(json) = self.0.strip_prefix('~') {
            if let Ok(value) = serde_json::from_str::<Value>(json) {
                return value;
            }
        }
        Value::String(self.0.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId(s)
    }
}

/// Identifier of one process's registry, stamped on events it publishes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        InstanceId(hex::encode(rand::random::<[u8; 16]>()))
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionMarker(pub i64);

impl VersionMarker {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        VersionMarker(duration.as_millis() as i64)
    }

    /// Read the marker from a document's `updatedAt` field.
    ///
    /// Accepts integer milliseconds or an extended-JSON `{"$date": millis}`.
    pub fn of(doc: &Document) -> Option<Self> {
        match doc.get(VERSION_FIELD)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::Object(obj) => obj.get("$date").and_then(Value::as_i64),
            _ => None,
        }
        .map(VersionMarker)
    }

    /// Marker of a document, falling back to the current time.
    pub fn of_or_now(doc: &Document) -> Self {
        Self::of(doc).unwrap_or_else(Self::now)
    }
}

impl fmt::Debug for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Stable key of a distinct observed query (SHA-256 of its canonical JSON).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(pub [u8; 32]);

impl QueryKey {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        QueryKey(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({}...)", &self.to_hex()[..8])
    }
}

/// Build a document from a JSON value, rejecting non-objects.
pub fn document(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// A document holding only the given id.
pub fn id_document(id: &DocId) -> Document {
    let mut doc = Document::new();
    doc.insert(ID_FIELD.to_string(), id.to_value());
    doc
}
