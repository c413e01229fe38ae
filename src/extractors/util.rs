//! Manifest traversal helpers shared by the extractors.

use serde_json::Value;

/// Array at a JSON pointer, or an empty slice.
pub fn array_at<'a>(manifest: &'a Value, pointer: &str) -> &'a [Value] {
    manifest
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// String at a JSON pointer.
pub fn string_at<'a>(manifest: &'a Value, pointer: &str) -> Option<&'a str> {
    manifest.pointer(pointer).and_then(Value::as_str)
}

/// String-to-string map at a JSON pointer.
pub fn string_map_at(
    manifest: &Value,
    pointer: &str,
) -> std::collections::BTreeMap<String, String> {
    manifest
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
