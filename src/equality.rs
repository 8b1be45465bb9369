//! Change-suppression equality for stored values.
//!
//! A `set` whose value equals the current one is a no-op. What "equals"
//! means is a [`ValueEquality`] strategy; the default compares JSON shapes
//! structurally.

use serde_json::{Map, Number, Value};

/// Decides whether two values are the same for change detection.
pub trait ValueEquality: Send + Sync {
    fn equals(&self, a: &Value, b: &Value) -> bool;
}

/// Recursive structural comparison over JSON shapes.
///
/// - values of different kinds are never equal
/// - numbers compare numerically, so `1` equals `1.0`
/// - arrays compare length first, then element-wise in order
/// - objects compare key sets, then values per key
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralEq;

impl ValueEquality for StructuralEq {
    fn equals(&self, a: &Value, b: &Value) -> bool {
        deep_equal(a, b)
    }
}

/// Treats every write as a change. Useful for event-like keys where
/// re-setting the same value must still notify.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysChanged;

impl ValueEquality for AlwaysChanged {
    fn equals(&self, _a: &Value, _b: &Value) -> bool {
        false
    }
}

/// Structural equality of two JSON values.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y),
        _ => false,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(l), Some(r)) = (x.as_i64(), y.as_i64()) {
        return l == r;
    }
    if let (Some(l), Some(r)) = (x.as_u64(), y.as_u64()) {
        return l == r;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn objects_equal(x: &Map<String, Value>, y: &Map<String, Value>) -> bool {
    if x.len() != y.len() {
        return false;
    }
    x.iter()
        .all(|(key, l)| y.get(key).is_some_and(|r| deep_equal(l, r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitives() {
        assert!(deep_equal(&json!(null), &json!(null)));
        assert!(deep_equal(&json!(true), &json!(true)));
        assert!(!deep_equal(&json!(true), &json!(false)));
        assert!(deep_equal(&json!("a"), &json!("a")));
        assert!(!deep_equal(&json!("a"), &json!("b")));
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert!(deep_equal(&json!(1), &json!(1.0)));
        assert!(deep_equal(&json!(-3), &json!(-3)));
        assert!(!deep_equal(&json!(1), &json!(2)));
        assert!(deep_equal(&json!(u64::MAX), &json!(u64::MAX)));
        assert!(!deep_equal(&json!(u64::MAX), &json!(u64::MAX - 1)));
    }

    #[test]
    fn test_kind_mismatch_is_unequal() {
        assert!(!deep_equal(&json!(0), &json!(false)));
        assert!(!deep_equal(&json!("1"), &json!(1)));
        assert!(!deep_equal(&json!([]), &json!({})));
        assert!(!deep_equal(&json!(null), &json!({})));
    }

    #[test]
    fn test_arrays() {
        assert!(deep_equal(&json!([1, [2, 3]]), &json!([1, [2, 3]])));
        assert!(!deep_equal(&json!([1, 2]), &json!([2, 1])));
        assert!(!deep_equal(&json!([1, 2]), &json!([1, 2, 3])));
    }

    #[test]
    fn test_objects() {
        assert!(deep_equal(
            &json!({"id": 1, "roles": ["admin"]}),
            &json!({"roles": ["admin"], "id": 1})
        ));
        assert!(!deep_equal(&json!({"id": 1}), &json!({"id": 1, "x": null})));
        assert!(!deep_equal(&json!({"id": 1}), &json!({"uid": 1})));
        assert!(!deep_equal(&json!({"a": {"b": 1}}), &json!({"a": {"b": 2}})));
    }

    #[test]
    fn test_always_changed() {
        assert!(!AlwaysChanged.equals(&json!(1), &json!(1)));
        assert!(StructuralEq.equals(&json!(1), &json!(1)));
    }
}
