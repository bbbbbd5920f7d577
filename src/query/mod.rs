//! Query shapes: selectors, options, and the document-level helpers used by
//! the reference store and the result sets.

pub mod matcher;
pub mod modifier;
pub mod projection;
pub mod sort;

use crate::error::{Result, SyncError};
use crate::types::{DocId, Document, ID_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub use matcher::{compare_values, matches, matches_value};
pub use modifier::{
    apply_modifier, apply_upsert_modifier, is_replacement, modifier_top_level_fields,
};
pub use projection::Projection;
pub use sort::{sort_documents, SortKey, SortOrder};

/// Options of an observed or executed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<SortKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Projection>,
    /// Explicit channel names replacing the collection channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    /// Force the broadcast strategy regardless of query shape.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.get_or_insert_with(Vec::new).push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn fields(mut self, projection: Projection) -> Self {
        self.fields = Some(projection);
        self
    }

    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channels.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Options used to re-query only ids and version markers.
    pub fn version_query(&self) -> Self {
        Self {
            fields: Some(Projection::include(["_id", crate::types::VERSION_FIELD])),
            ..self.clone()
        }
    }

    /// Same query without a field projection, for fetching full documents.
    pub fn unprojected(&self) -> Self {
        Self {
            fields: None,
            ..self.clone()
        }
    }

    /// Top-level fields the sort depends on.
    pub fn sort_fields(&self) -> Vec<String> {
        self.sort
            .iter()
            .flatten()
            .map(|key| top_level(&key.field).to_string())
            .collect()
    }
}

// --- Selectors ---

/// Normalize a selector: a bare string means `{_id: <string>}`, null means `{}`.
pub fn normalize_selector(selector: Value) -> Result<Value> {
    match selector {
        Value::Null => Ok(json!({})),
        Value::String(id) => Ok(json!({ "_id": id })),
        Value::Object(_) => Ok(selector),
        other => Err(SyncError::InvalidSelector(format!(
            "selector must be an object or id, got {}",
            other
        ))),
    }
}

/// Ids an `_id` constraint pins the selector to, if any.
///
/// Recognizes `{_id: x}`, `{_id: {$eq: x}}` and `{_id: {$in: [...]}}` for
/// scalar ids.
pub fn selector_ids(selector: &Value) -> Option<Vec<DocId>> {
    let constraint = selector.as_object()?.get(ID_FIELD)?;
    match constraint {
        Value::Object(ops) if ops.len() == 1 => {
            if let Some(id) = ops.get("$eq") {
                return DocId::from_value(id).map(|id| vec![id]);
            }
            let list = ops.get("$in")?.as_array()?;
            list.iter().map(DocId::from_value).collect()
        }
        other => DocId::from_value(other).map(|id| vec![id]),
    }
}

/// Whether the selector constrains nothing but `_id`.
pub fn is_id_only(selector: &Value) -> bool {
    match selector.as_object() {
        Some(obj) => obj.len() == 1 && selector_ids(selector).is_some(),
        None => false,
    }
}

/// Top-level fields referenced by a selector, including inside `$and`/`$or`/`$nor`.
pub fn selector_fields(selector: &Value) -> Vec<String> {
    let mut fields = Vec::new();
    collect_selector_fields(selector, &mut fields);
    fields.sort();
    fields.dedup();
    fields
}

fn collect_selector_fields(selector: &Value, out: &mut Vec<String>) {
    let Some(obj) = selector.as_object() else {
        return;
    };
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                for sub in value.as_array().into_iter().flatten() {
                    collect_selector_fields(sub, out);
                }
            }
            k if k.starts_with('$') => {}
            k => out.push(top_level(k).to_string()),
        }
    }
}

/// Equality constraints of a selector, as the seed of an upserted document.
pub fn selector_equalities(selector: &Value) -> Document {
    let mut seed = Document::new();
    let Some(obj) = selector.as_object() else {
        return seed;
    };
    for (key, value) in obj {
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        let is_operator = value
            .as_object()
            .map(|o| o.keys().any(|k| k.starts_with('$')))
            .unwrap_or(false);
        if !is_operator {
            seed.insert(key.clone(), value.clone());
        }
    }
    seed
}

/// Restrict a selector to the given ids.
pub fn restrict_to_ids(selector: &Value, ids: &[DocId]) -> Value {
    let id_list: Vec<Value> = ids.iter().map(DocId::to_value).collect();
    let by_id = json!({ "_id": { "$in": id_list } });
    match selector.as_object() {
        Some(obj) if obj.is_empty() => by_id,
        _ => json!({ "$and": [selector, by_id] }),
    }
}

// --- Paths ---

/// First segment of a dotted path.
pub fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Resolve a dotted path.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => return Err(SyncError::InvalidModifier("empty field path".to_string())),
    };
    let mut current: &mut Map<String, Value> = doc;
    for part in parents {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(obj) => obj,
            _ => {
                return Err(SyncError::InvalidModifier(format!(
                    "cannot create field '{}' inside non-object at '{}'",
                    path, part
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Mutable access to a dotted path.
pub fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Value> {
    let mut parts = path.split('.');
    let mut current = doc.get_mut(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Remove a dotted path, returning the removed value.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.remove(path),
        Some((parent, last)) => match get_path_mut(doc, parent)? {
            Value::Object(obj) => obj.remove(last),
            _ => None,
        },
    }
}

/// Copy of `doc` holding only `_id` and the given top-level fields.
///
/// Fields absent from `doc` appear as `null` so receivers clear them.
pub fn pick_fields(doc: &Document, fields: &[String]) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get(ID_FIELD) {
        out.insert(ID_FIELD.to_string(), id.clone());
    }
    for field in fields {
        let key = top_level(field);
        if key == ID_FIELD {
            continue;
        }
        out.insert(
            key.to_string(),
            doc.get(key).cloned().unwrap_or(Value::Null),
        );
    }
    out
}
