//! Value codec for hash-shaped cache entries.
//!
//! Redis hash fields only hold scalar strings, so nested records are
//! flattened into path-keyed string maps. Null leaves are written as the
//! literal sentinel `"null"` so they round-trip distinguishably from fields
//! that were never cached.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Separator between nested path segments in flattened field names.
pub const PATH_SEPARATOR: &str = "__";

const NULL_SENTINEL: &str = "null";
const UNDEFINED_SENTINEL: &str = "undefined";

/// Flattens a nested JSON object into hash field/value pairs.
///
/// Nested objects extend the field name with [`PATH_SEPARATOR`]; arrays at
/// any depth become their JSON encoding; scalars stringify bare (no quotes).
pub fn flatten(obj: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into("", obj, &mut out);
    out
}

fn flatten_into(prefix: &str, obj: &Map<String, Value>, out: &mut BTreeMap<String, String>) {
    for (key, value) in obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{PATH_SEPARATOR}{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(&path, nested, out),
            other => {
                out.insert(path, stringify_value(other));
            }
        }
    }
}

/// Stringifies one value the way [`flatten`] does for leaves.
///
/// Write paths that merge individual fields into an existing hash use this
/// so hand-merged fields match full-flatten output byte for byte.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::Null => NULL_SENTINEL.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

/// Stringifies a field of a nested child hash.
///
/// Children are updated piecemeal, so nulls become empty strings rather
/// than sentinels; an empty field reads the same as an absent one there.
fn stringify_child_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => other.to_string(),
    }
}

/// Inverse of [`stringify_value`], applied field by field on reads.
pub fn parse_value(raw: &str) -> Value {
    if raw == NULL_SENTINEL || raw == UNDEFINED_SENTINEL {
        return Value::Null;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Flattens each child of a JSON object into per-field strings for one
/// child hash.
pub fn child_hash_fields(child: &Map<String, Value>) -> Vec<(String, String)> {
    child
        .iter()
        .map(|(key, value)| (key.clone(), stringify_child_field(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn flatten_nests_with_double_underscore() {
        let flat = flatten(&obj(json!({
            "id": "s1",
            "student": { "email": "a@b.c", "user_id": null },
            "score": 7.5,
        })));

        assert_eq!(flat.get("id").map(String::as_str), Some("s1"));
        assert_eq!(flat.get("student__email").map(String::as_str), Some("a@b.c"));
        assert_eq!(flat.get("student__user_id").map(String::as_str), Some("null"));
        assert_eq!(flat.get("score").map(String::as_str), Some("7.5"));
    }

    #[test]
    fn arrays_stringify_as_json_at_any_depth() {
        let flat = flatten(&obj(json!({
            "tags": ["a", "b"],
            "meta": { "picks": [1, 2] },
        })));

        assert_eq!(flat.get("tags").map(String::as_str), Some(r#"["a","b"]"#));
        assert_eq!(flat.get("meta__picks").map(String::as_str), Some("[1,2]"));
    }

    #[test]
    fn parse_recognizes_sentinels_and_json() {
        assert_eq!(parse_value("null"), Value::Null);
        assert_eq!(parse_value("undefined"), Value::Null);
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value(r#"["a","b"]"#), json!(["a", "b"]));
        assert_eq!(parse_value("plain text"), json!("plain text"));
    }

    #[test]
    fn flatten_parse_round_trip_under_coercion() {
        let source = obj(json!({
            "count": 3,
            "ratio": 0.5,
            "done": false,
            "gone": null,
            "ids": ["x", "y"],
            "inner": { "name": "deep" },
        }));

        let flat = flatten(&source);
        assert_eq!(parse_value(&flat["count"]), json!(3));
        assert_eq!(parse_value(&flat["ratio"]), json!(0.5));
        assert_eq!(parse_value(&flat["done"]), json!(false));
        assert_eq!(parse_value(&flat["gone"]), Value::Null);
        assert_eq!(parse_value(&flat["ids"]), json!(["x", "y"]));
        assert_eq!(parse_value(&flat["inner__name"]), json!("deep"));
    }

    #[test]
    fn child_fields_use_empty_string_for_null() {
        let fields = child_hash_fields(&obj(json!({
            "score": null,
            "submitted_choices": ["a"],
            "point_value": 2,
        })));
        let lookup: std::collections::BTreeMap<_, _> = fields.into_iter().collect();

        assert_eq!(lookup.get("score").map(String::as_str), Some(""));
        assert_eq!(
            lookup.get("submitted_choices").map(String::as_str),
            Some(r#"["a"]"#)
        );
        assert_eq!(lookup.get("point_value").map(String::as_str), Some("2"));
    }
}
