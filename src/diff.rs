//! Top-level field diff between two versions of a document.

use crate::types::{Document, ID_FIELD};
use serde_json::Value;

/// Maximum nesting depth compared structurally; deeper subtrees count as changed.
const MAX_DIFF_DEPTH: usize = 100;

/// Top-level fields that changed between two document versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDiff {
    /// Fields added or given a different value.
    pub updated: Vec<String>,
    /// Fields present before and absent after.
    pub cleared: Vec<String>,
}

impl FieldDiff {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.cleared.is_empty()
    }

    /// Updated and cleared fields together.
    pub fn all_fields(&self) -> Vec<String> {
        self.updated
            .iter()
            .chain(self.cleared.iter())
            .cloned()
            .collect()
    }
}

/// Diff two documents at the top level. `_id` is never reported.
pub fn top_level_diff(before: &Document, after: &Document) -> FieldDiff {
    let mut diff = FieldDiff::default();
    for (key, value) in after {
        if key == ID_FIELD {
            continue;
        }
        match before.get(key) {
            Some(old) if deep_equal(old, value) => {}
            _ => diff.updated.push(key.clone()),
        }
    }
    for key in before.keys() {
        if key != ID_FIELD && !after.contains_key(key) {
            diff.cleared.push(key.clone());
        }
    }
    diff
}

/// Structural equality guarded by a stack of visited pairs.
///
/// A pair seen again on the current path, or nesting past
/// `MAX_DIFF_DEPTH`, is treated as unequal.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    let mut visiting: Vec<(*const Value, *const Value)> = Vec::new();
    equal_inner(a, b, &mut visiting)
}

fn equal_inner(a: &Value, b: &Value, visiting: &mut Vec<(*const Value, *const Value)>) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            if ma.len() != mb.len() {
                return false;
            }
            let pair = (a as *const Value, b as *const Value);
            if visiting.len() >= MAX_DIFF_DEPTH || visiting.contains(&pair) {
                return false;
            }
            visiting.push(pair);
            let equal = ma.iter().all(|(k, va)| match mb.get(k) {
                Some(vb) => equal_inner(va, vb, visiting),
                None => false,
            });
            visiting.pop();
            equal
        }
        (Value::Array(xa), Value::Array(xb)) => {
            if xa.len() != xb.len() {
                return false;
            }
            let pair = (a as *const Value, b as *const Value);
            if visiting.len() >= MAX_DIFF_DEPTH || visiting.contains(&pair) {
                return false;
            }
            visiting.push(pair);
            let equal = xa
                .iter()
                .zip(xb.iter())
                .all(|(va, vb)| equal_inner(va, vb, visiting));
            visiting.pop();
            equal
        }
        (Value::Number(na), Value::Number(nb)) => na == nb || na.as_f64() == nb.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::document;
    use serde_json::json;

    #[test]
    fn test_diff_reports_updated_and_cleared() {
        let before = document(json!({"_id": "a", "x": 1, "y": {"z": [1, 2]}, "gone": true})).unwrap();
        let after = document(json!({"_id": "a", "x": 2, "y": {"z": [1, 2]}, "new": 0})).unwrap();

        let diff = top_level_diff(&before, &after);
        assert_eq!(diff.updated, vec!["new", "x"]);
        assert_eq!(diff.cleared, vec!["gone"]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_identical_documents_have_empty_diff() {
        let doc = document(json!({"_id": "a", "nested": {"deep": [{"k": 1}]}})).unwrap();
        assert!(top_level_diff(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(!deep_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn test_excessive_depth_is_unequal() {
        let mut a = json!(0);
        for _ in 0..(MAX_DIFF_DEPTH + 5) {
            a = json!({ "n": a });
        }
        let b = a.clone();
        assert!(!deep_equal(&a, &b));
        // Shallow structures compare fine.
        assert!(deep_equal(&json!({"n": {"n": 1}}), &json!({"n": {"n": 1}})));
    }
}
