//! Canonical JSON encoding: sorted keys, compact separators, stable output.
//!
//! This is a wire-format contract, not a style choice — every `sha256:<hex>` digest
//! in the system is computed over this exact encoding, so two logically equal
//! payloads must serialize identically regardless of field insertion order.

use serde::Serialize;
use serde_json::Value;

/// Serialize `value` to canonical JSON: object keys sorted lexicographically at
/// every nesting level, compact `,`/`:` separators, UTF-8 preserved verbatim.
pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let raw = serde_json::to_value(value).expect("value must serialize to JSON");
    let mut out = String::new();
    write_canonical(&raw, &mut out);
    out
}

/// Canonicalize an already-constructed [`Value`].
pub fn canonical_json_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_level() {
        let a = json!({"b": 1, "a": {"z": 1, "y": 2}});
        let b = json!({"a": {"y": 2, "z": 1}, "b": 1});
        assert_eq!(canonical_json_value(&a), canonical_json_value(&b));
    }

    #[test]
    fn uses_compact_separators() {
        let v = json!({"a": [1, 2], "b": "x"});
        let s = canonical_json_value(&v);
        assert!(!s.contains(' '));
        assert_eq!(s, r#"{"a":[1,2],"b":"x"}"#);
    }

    #[test]
    fn preserves_non_ascii() {
        let v = json!({"name": "caf\u{e9}"});
        let s = canonical_json_value(&v);
        assert!(s.contains('\u{e9}') || s.contains("\\u00e9"));
    }
}
