//! Tree helpers shared by the configuration layers.

use serde_json::{Map, Value};

/// Recursively merges `overlay` into `base`. Objects merge key by key,
/// everything else is replaced.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(existing) = base_map.get_mut(key) {
                    if existing.is_object() && value.is_object() {
                        merge(existing, value);
                        continue;
                    }
                }
                base_map.insert(key.clone(), value.clone());
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Returns the leaves of `new` that differ from `old`, nested the same way.
/// Leaves present in `old` but missing from `new` are reported as `null`.
pub fn diff_leaves(old: &Value, new: &Value) -> Value {
    let mut out = Map::new();
    diff_into(old, new, &mut out);
    Value::Object(out)
}

fn diff_into(old: &Value, new: &Value, out: &mut Map<String, Value>) {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return;
    };

    for (key, new_value) in new_map {
        match old_map.get(key) {
            Some(old_value) if old_value.is_object() && new_value.is_object() => {
                let mut nested = Map::new();
                diff_into(old_value, new_value, &mut nested);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Object(nested));
                }
            }
            Some(old_value) if old_value == new_value => {}
            _ => {
                out.insert(key.clone(), new_value.clone());
            }
        }
    }
    for key in old_map.keys() {
        if !new_map.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }
}

/// Splits a dotted key (`device.parallel_capture`) into its segments.
pub fn split_key(key: &str) -> Vec<&str> {
    key.split('.').filter(|s| !s.is_empty()).collect()
}

pub fn get_path<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(tree, |node, segment| node.get(*segment))
}

/// Writes `value` at `path`, creating intermediate objects as needed.
/// Non-object nodes along the way are replaced.
pub fn set_path(tree: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *tree = value;
        return;
    };

    let mut node = tree;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        node = match node {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.to_string(), value);
    }
}

pub fn remove_path(tree: &mut Value, path: &[&str]) -> Option<Value> {
    let (last, parents) = path.split_last()?;
    let mut node = tree;
    for segment in parents {
        node = node.get_mut(*segment)?;
    }
    node.as_object_mut()?.remove(*last)
}

/// An empty object, the neutral element for [`merge`].
pub fn empty() -> Value {
    Value::Object(Map::new())
}
