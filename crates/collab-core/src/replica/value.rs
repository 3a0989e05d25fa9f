//! Conversion between Loro values and JSON attribute values.

use crate::snapshot::Attrs;
use loro::LoroValue;

/// Convert LoroValue to serde_json::Value. Container values become null.
pub fn loro_value_to_json(value: &LoroValue) -> serde_json::Value {
    match value {
        LoroValue::Null => serde_json::Value::Null,
        LoroValue::Bool(b) => serde_json::Value::Bool(*b),
        LoroValue::I64(n) => serde_json::json!(*n),
        LoroValue::Double(n) => serde_json::json!(*n),
        LoroValue::String(s) => serde_json::Value::String(s.to_string()),
        LoroValue::List(arr) => {
            serde_json::Value::Array(arr.iter().map(loro_value_to_json).collect())
        }
        LoroValue::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

/// Read a deep map value as an attribute map.
pub fn loro_map_to_attrs(value: &LoroValue) -> Attrs {
    match value {
        LoroValue::Map(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
            .collect(),
        _ => Attrs::new(),
    }
}
