//! Update modifiers (`$set`, `$inc`, ...) applied to documents in place.

use super::{compare_values, get_path, get_path_mut, matches_value, remove_path, set_path, top_level};
use crate::error::{Result, SyncError};
use crate::types::{Document, ID_FIELD};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// A modifier with no `$` keys replaces the whole document.
pub fn is_replacement(modifier: &Value) -> bool {
    modifier
        .as_object()
        .map(|obj| !obj.keys().any(|k| k.starts_with('$')))
        .unwrap_or(false)
}

/// Apply a modifier to an existing document.
pub fn apply_modifier(doc: &mut Document, modifier: &Value) -> Result<()> {
    apply(doc, modifier, false)
}

/// Apply a modifier to a freshly upserted document (honors `$setOnInsert`).
pub fn apply_upsert_modifier(doc: &mut Document, modifier: &Value) -> Result<()> {
    apply(doc, modifier, true)
}

fn apply(doc: &mut Document, modifier: &Value, inserting: bool) -> Result<()> {
    let ops = modifier
        .as_object()
        .ok_or_else(|| SyncError::InvalidModifier("modifier must be an object".to_string()))?;

    if is_replacement(modifier) {
        let id = doc.get(ID_FIELD).cloned();
        *doc = ops.clone();
        if let Some(id) = id {
            doc.insert(ID_FIELD.to_string(), id);
        }
        return Ok(());
    }

    for (op, fields) in ops {
        let fields = fields.as_object().ok_or_else(|| {
            SyncError::InvalidModifier(format!("{} expects an object of fields", op))
        })?;
        for (path, operand) in fields {
            if top_level(path) == ID_FIELD && op != "$setOnInsert" {
                return Err(SyncError::InvalidModifier("_id is immutable".to_string()));
            }
            apply_field(doc, op, path, operand, inserting)?;
        }
    }
    Ok(())
}

fn apply_field(
    doc: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
    inserting: bool,
) -> Result<()> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" | "$mul" => {
            let current = get_path(doc, path).cloned();
            let result = arithmetic(op, path, current.as_ref(), operand)?;
            set_path(doc, path, result)
        }
        "$min" | "$max" => {
            let wanted = if op == "$min" {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => compare_values(operand, current) == wanted,
            };
            if replace {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$push" | "$addToSet" => {
            let items = each_items(operand);
            let array = array_at(doc, path)?;
            for item in items {
                if op == "$addToSet" && array.iter().any(|existing| existing == &item) {
                    continue;
                }
                array.push(item);
            }
            Ok(())
        }
        "$pull" => {
            if let Some(Value::Array(items)) = get_path_mut(doc, path) {
                let mut kept = Vec::with_capacity(items.len());
                for item in items.drain(..) {
                    if !matches_value(&item, operand)? {
                        kept.push(item);
                    }
                }
                *items = kept;
            }
            Ok(())
        }
        "$rename" => {
            let to = operand
                .as_str()
                .ok_or_else(|| SyncError::InvalidModifier("$rename expects a string".to_string()))?;
            if let Some(value) = remove_path(doc, path) {
                set_path(doc, to, value)?;
            }
            Ok(())
        }
        other => Err(SyncError::UnsupportedOperator(other.to_string())),
    }
}

fn arithmetic(op: &str, path: &str, current: Option<&Value>, operand: &Value) -> Result<Value> {
    let Value::Number(by) = operand else {
        return Err(SyncError::InvalidModifier(format!(
            "{} on '{}' expects a number",
            op, path
        )));
    };
    let base = match current {
        None => Number::from(0),
        Some(Value::Number(n)) => n.clone(),
        Some(other) => {
            return Err(SyncError::InvalidModifier(format!(
                "{} on '{}' cannot modify non-number {}",
                op, path, other
            )))
        }
    };
    if let (Some(a), Some(b)) = (base.as_i64(), by.as_i64()) {
        let exact = if op == "$inc" {
            a.checked_add(b)
        } else {
            a.checked_mul(b)
        };
        if let Some(v) = exact {
            return Ok(Value::Number(v.into()));
        }
    }
    let a = base.as_f64().unwrap_or(0.0);
    let b = by.as_f64().unwrap_or(0.0);
    let v = if op == "$inc" { a + b } else { a * b };
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| SyncError::InvalidModifier(format!("{} on '{}' overflowed", op, path)))
}

fn each_items(operand: &Value) -> Vec<Value> {
    match operand.as_object().and_then(|o| o.get("$each")) {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![operand.clone()],
    }
}

fn array_at<'a>(doc: &'a mut Document, path: &str) -> Result<&'a mut Vec<Value>> {
    if get_path(doc, path).is_none() {
        set_path(doc, path, Value::Array(Vec::new()))?;
    }
    match get_path_mut(doc, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(SyncError::InvalidModifier(format!(
            "field '{}' is not an array",
            path
        ))),
    }
}

/// Top-level fields a modifier touches, deduplicated in first-seen order.
///
/// For a replacement this is every key of the replacement; callers diff the
/// documents to learn which keys it dropped.
pub fn modifier_top_level_fields(modifier: &Value) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        let key = top_level(path);
        if key != ID_FIELD && !fields.iter().any(|f| f == key) {
            fields.push(key.to_string());
        }
    };

    let Some(ops) = modifier.as_object() else {
        return Vec::new();
    };
    if is_replacement(modifier) {
        ops.keys().for_each(|k| push(k));
        return fields;
    }
    for (op, paths) in ops {
        if op == "$setOnInsert" {
            continue;
        }
        for (path, operand) in paths.as_object().unwrap_or(&Map::new()) {
            push(path);
            if op == "$rename" {
                if let Some(to) = operand.as_str() {
                    push(to);
                }
            }
        }
    }
    fields
}
