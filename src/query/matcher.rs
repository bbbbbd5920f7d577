//! Selector evaluation with MongoDB-style semantics and array lifting.

use super::get_path;
use crate::error::{Result, SyncError};
use crate::types::Document;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Compare two JSON values for ordering.
///
/// Nulls sort after everything else; numbers compare as f64; strings by
/// codepoint; across types: number < string < bool < other.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(f64::NAN);
            let fb = nb.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

/// Numeric-aware equality (`1` equals `1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => na.as_f64() == nb.as_f64(),
        _ => a == b,
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) if !obj.is_empty() => obj.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

/// Evaluate a selector against a document.
pub fn matches(doc: &Document, selector: &Value) -> Result<bool> {
    let Some(filter) = selector.as_object() else {
        return Err(SyncError::InvalidSelector(format!(
            "selector must be an object, got {}",
            selector
        )));
    };

    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => sub_selectors(key, condition)?
                .iter()
                .try_fold(true, |acc, sub| Ok::<_, SyncError>(acc && matches(doc, sub)?))?,
            "$or" => {
                let subs = sub_selectors(key, condition)?;
                let mut any = false;
                for sub in subs {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let subs = sub_selectors(key, condition)?;
                let mut none = true;
                for sub in subs {
                    if matches(doc, sub)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$comment" => true,
            other if other.starts_with('$') => {
                return Err(SyncError::UnsupportedOperator(other.to_string()))
            }
            path => matches_field(get_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_selectors<'a>(op: &str, condition: &'a Value) -> Result<&'a Vec<Value>> {
    condition
        .as_array()
        .ok_or_else(|| SyncError::InvalidSelector(format!("{} expects an array", op)))
}

/// Evaluate a field condition against a single value (used by `$pull`).
pub fn matches_value(value: &Value, condition: &Value) -> Result<bool> {
    if is_operator_object(condition) {
        matches_field(Some(value), condition)
    } else if let (Value::Object(_), Value::Object(sub)) = (value, condition) {
        // Embedded-document condition on an array element.
        let doc = value.as_object().cloned().unwrap_or_default();
        matches(&doc, &Value::Object(sub.clone()))
    } else {
        Ok(values_equal(value, condition))
    }
}

fn matches_field(value: Option<&Value>, condition: &Value) -> Result<bool> {
    match condition.as_object() {
        Some(ops) if is_operator_object(condition) => evaluate_operators(value, ops),
        _ => Ok(equals_lifted(value.unwrap_or(&Value::Null), condition)),
    }
}

fn equals_lifted(value: &Value, operand: &Value) -> bool {
    if values_equal(value, operand) {
        return true;
    }
    match value {
        Value::Array(items) if !operand.is_array() => {
            items.iter().any(|item| values_equal(item, operand))
        }
        _ => false,
    }
}

fn evaluate_operators(value: Option<&Value>, ops: &Map<String, Value>) -> Result<bool> {
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$exists" => {
                let want = operand.as_bool().unwrap_or(true);
                value.is_some() == want
            }
            "$not" => !matches_field(value, operand)?,
            "$options" => true,
            _ => evaluate_operator(value.unwrap_or(&Value::Null), op, operand, ops)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Comparison operators lifted over arrays: any element may satisfy.
const LIFTABLE_OPS: &[&str] = &["$eq", "$gt", "$gte", "$lt", "$lte", "$regex"];

fn evaluate_operator(
    value: &Value,
    op: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> Result<bool> {
    if let Value::Array(items) = value {
        if LIFTABLE_OPS.contains(&op) && !operand.is_array() {
            for item in items {
                if evaluate_scalar(item, op, operand, siblings)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    }
    evaluate_scalar(value, op, operand, siblings)
}

fn evaluate_scalar(
    value: &Value,
    op: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> Result<bool> {
    let ordered = |wanted: &[Ordering]| {
        if value.is_null() || operand.is_null() || type_rank(value) != type_rank(operand) {
            return false;
        }
        wanted.contains(&compare_values(value, operand))
    };

    match op {
        "$eq" => Ok(values_equal(value, operand)),
        "$ne" => Ok(!equals_lifted(value, operand)),
        "$gt" => Ok(ordered(&[Ordering::Greater])),
        "$gte" => Ok(ordered(&[Ordering::Greater, Ordering::Equal])),
        "$lt" => Ok(ordered(&[Ordering::Less])),
        "$lte" => Ok(ordered(&[Ordering::Less, Ordering::Equal])),
        "$in" => {
            let items = operand
                .as_array()
                .ok_or_else(|| SyncError::InvalidSelector("$in expects an array".to_string()))?;
            Ok(items.iter().any(|item| equals_lifted(value, item)))
        }
        "$nin" => {
            let items = operand
                .as_array()
                .ok_or_else(|| SyncError::InvalidSelector("$nin expects an array".to_string()))?;
            Ok(!items.iter().any(|item| equals_lifted(value, item)))
        }
        "$size" => {
            let expected = operand.as_u64();
            Ok(match (value.as_array(), expected) {
                (Some(items), Some(n)) => items.len() as u64 == n,
                _ => false,
            })
        }
        "$all" => {
            let targets = operand
                .as_array()
                .ok_or_else(|| SyncError::InvalidSelector("$all expects an array".to_string()))?;
            Ok(match value.as_array() {
                Some(items) => targets
                    .iter()
                    .all(|t| items.iter().any(|item| values_equal(item, t))),
                None => false,
            })
        }
        "$regex" => {
            let Some(text) = value.as_str() else {
                return Ok(false);
            };
            let pattern = operand
                .as_str()
                .ok_or_else(|| SyncError::InvalidSelector("$regex expects a string".to_string()))?;
            let flags = siblings
                .get("$options")
                .and_then(Value::as_str)
                .unwrap_or("");
            let pattern = if flags.is_empty() {
                pattern.to_string()
            } else {
                format!("(?{}){}", flags, pattern)
            };
            Ok(regex::Regex::new(&pattern)?.is_match(text))
        }
        other => Err(SyncError::UnsupportedOperator(other.to_string())),
    }
}
