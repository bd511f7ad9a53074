//! JSON tree helpers used by `load` and `update`.

use serde_json::{Map, Value};

use crate::error::{ConfigError, ConfigResult};

/// Merge `overlay` into `base`: objects merge key by key, anything else
/// replaces the existing value.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Write `value` at the dot-delimited `path`, creating missing objects and
/// replacing non-object intermediates.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when the path or any segment is empty.
pub fn set_nested_value(root: &mut Value, path: &str, value: Value) -> ConfigResult<()> {
    if path.trim().is_empty() {
        return Err(ConfigError::validation(path, "empty_key_path", None));
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(ConfigError::validation(
            path,
            "empty_path_segment",
            Some(path.to_string()),
        ));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| ConfigError::validation(path, "empty_key_path", None))?;

    let mut cursor = root;
    for segment in parents {
        cursor = object_mut(cursor)
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    object_mut(cursor).insert((*last).to_string(), value);
    Ok(())
}

fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}
