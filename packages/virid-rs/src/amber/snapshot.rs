//! Default snapshot handling over `serde_json::Value`.
//!
//! Snapshots are plain structural copies. Keys starting with `_` are treated
//! as private and never captured, compared or restored.

use std::rc::Rc;

use serde_json::{Map, Value};

/// An immutable, shareable serialized state. Identity (`Rc::ptr_eq`) is how
/// the tick store tells "already current" from "needs restoring".
pub type Snapshot = Rc<Value>;

fn is_private(key: &str) -> bool {
    key.starts_with('_')
}

/// Copy `value`, dropping private keys down to `depth` levels of nesting.
///
/// Containers reached at depth 0 are copied whole, private keys included, so
/// a restore never loses data that sits below the bound.
pub fn capture(value: &Value, depth: usize) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) if depth == 0 => value.clone(),
        Value::Array(items) => Value::Array(items.iter().map(|v| capture(v, depth - 1)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(key, _)| !is_private(key))
                .map(|(key, v)| (key.clone(), capture(v, depth - 1)))
                .collect(),
        ),
        leaf => leaf.clone(),
    }
}

/// Merge `incoming` into `target` depth-first.
///
/// Where both sides hold an object the merge recurses into the existing one;
/// everything else (leaves, arrays, shape changes) is replaced. Public keys
/// absent from `incoming` are removed; private keys keep their live value.
pub fn merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(live), Value::Object(snapshot)) => {
            for (key, value) in snapshot {
                let nested = matches!(
                    (live.get(key), value),
                    (Some(Value::Object(_)), Value::Object(_))
                );
                if nested {
                    if let Some(existing) = live.get_mut(key) {
                        merge(existing, value);
                    }
                } else {
                    live.insert(key.clone(), value.clone());
                }
            }
            live.retain(|key, _| is_private(key) || snapshot.contains_key(key));
        }
        (target, incoming) => *target = incoming.clone(),
    }
}

/// Whether `live` differs from `old`, comparing `depth` levels of nesting.
///
/// Past the depth bound any non-empty container counts as changed, so deep
/// edits are never missed.
pub fn diff(old: &Value, live: &Value, depth: usize) -> bool {
    match (old, live) {
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return true;
            }
            if a.is_empty() {
                return false;
            }
            if depth == 0 {
                return true;
            }
            a.iter().zip(b).any(|(x, y)| diff(x, y, depth - 1))
        }
        (Value::Object(a), Value::Object(b)) => {
            let public = |m: &Map<String, Value>| m.keys().filter(|k| !is_private(k)).count();
            let count = public(a);
            if count != public(b) {
                return true;
            }
            if count == 0 {
                return false;
            }
            if depth == 0 {
                return true;
            }
            a.iter()
                .filter(|(key, _)| !is_private(key))
                .any(|(key, v)| match b.get(key) {
                    Some(w) => diff(v, w, depth - 1),
                    None => true,
                })
        }
        (a, b) => a != b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capture_skips_private_keys() {
        let live = json!({ "count": 3, "_cache": [1, 2], "nested": { "_id": 7, "name": "a" } });

        let snapshot = capture(&live, 5);

        assert_eq!(snapshot, json!({ "count": 3, "nested": { "name": "a" } }));
    }

    #[test]
    fn capture_copies_containers_past_depth_whole() {
        let live = json!({ "a": { "b": { "c": 1, "_d": 2 } }, "list": [[1], 2] });

        let snapshot = capture(&live, 2);

        assert_eq!(
            snapshot,
            json!({ "a": { "b": { "c": 1, "_d": 2 } }, "list": [[1], 2] })
        );
    }

    #[test]
    fn restore_past_depth_keeps_deep_arrays() {
        let original = json!({ "grid": { "rows": [[1, 2], [3, 4]] } });
        let snapshot = capture(&original, 1);
        let mut live = json!({ "grid": { "rows": [[9]] } });

        merge(&mut live, &snapshot);

        assert_eq!(live, original);
    }

    #[test]
    fn merge_recurses_into_objects_and_replaces_the_rest() {
        let mut live = json!({
            "settings": { "theme": "dark", "_handle": 9 },
            "tags": ["x", "y"],
            "count": 1,
        });

        merge(
            &mut live,
            &json!({ "settings": { "theme": "light" }, "tags": ["z"], "count": 5 }),
        );

        assert_eq!(
            live,
            json!({
                "settings": { "theme": "light", "_handle": 9 },
                "tags": ["z"],
                "count": 5,
            })
        );
    }

    #[test]
    fn merge_drops_public_keys_missing_from_snapshot() {
        let mut live = json!({
            "items": { "shield": 1, "sword": 1 },
            "_cache": 4,
            "extra": true,
        });

        merge(&mut live, &json!({ "items": { "shield": 1 } }));

        assert_eq!(live, json!({ "items": { "shield": 1 }, "_cache": 4 }));
    }

    #[test]
    fn merge_replaces_on_shape_change() {
        let mut live = json!({ "value": { "inner": 1 } });

        merge(&mut live, &json!({ "value": 3 }));

        assert_eq!(live, json!({ "value": 3 }));
    }

    #[test]
    fn diff_detects_leaf_and_length_changes() {
        let old = json!({ "count": 1, "items": [1, 2] });

        assert!(!diff(&old, &json!({ "count": 1, "items": [1, 2] }), 5));
        assert!(diff(&old, &json!({ "count": 2, "items": [1, 2] }), 5));
        assert!(diff(&old, &json!({ "count": 1, "items": [1, 2, 3] }), 5));
        assert!(diff(&old, &json!({ "count": "1", "items": [1, 2] }), 5));
    }

    #[test]
    fn diff_ignores_private_keys() {
        let old = json!({ "count": 1 });
        let live = json!({ "count": 1, "_scratch": "changed every frame" });

        assert!(!diff(&old, &live, 5));
    }

    #[test]
    fn diff_past_depth_assumes_change() {
        let deep = json!({ "a": { "b": { "c": 1 } } });

        assert!(!diff(&deep, &deep.clone(), 5));
        assert!(diff(&deep, &deep.clone(), 1));
    }

    #[test]
    fn deep_snapshot_diffs_only_past_the_diff_bound() {
        let live = json!({ "a": { "b": { "c": 1 } } });
        let snapshot = capture(&live, 2);

        assert!(!diff(&snapshot, &live, 5));
        assert!(diff(&snapshot, &live, 1));
    }
}
