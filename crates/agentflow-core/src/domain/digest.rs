//! Content hashes over canonical JSON.
//!
//! Two values that differ only in object key order, or in whether an integral
//! number was written as `1` or `1.0`, share one canonical form and one hash.
//! Object keys are ordered by UTF-16 code units (RFC 8785 §3.2.3); arrays keep
//! their order. Descriptor equality, context-package identity and artifact
//! addresses all go through here.

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::domain::error::{OrchestrationError, Result};

/// Integral floats below 2^53 print as integers; above that `f64` has already
/// lost the digits that would make the integer form meaningful.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Compact canonical serialization of `value`.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, (key, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&encode_string(key)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => out.push_str(&encode_string(s)?),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
    Ok(())
}

fn encode_string(s: &str) -> Result<String> {
    serde_json::to_string(s).map_err(|e| OrchestrationError::Canonicalization(e.to_string()))
}

fn canonical_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

/// SHA-256 hex of the canonical form.
pub fn compute_digest(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Digest of any serializable value via its canonical JSON form.
pub fn digest_of<T: Serialize>(value: &T) -> Result<String> {
    compute_digest(&serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::descriptor::SpecialistDescriptor;
    use serde_json::json;

    #[test]
    fn test_integral_confidence_matches_integer_spelling() {
        assert_eq!(canonical_json(&json!({ "confidence": 1.0 })).unwrap(), r#"{"confidence":1}"#);
        assert_eq!(canonical_json(&json!({ "confidence": 0.85 })).unwrap(), r#"{"confidence":0.85}"#);
        assert_eq!(
            compute_digest(&json!({ "confidence": 1.0 })).unwrap(),
            compute_digest(&json!({ "confidence": 1 })).unwrap()
        );
    }

    #[test]
    fn test_keys_sorted_by_utf16_code_units() {
        // U+1F600 encodes as a surrogate pair (0xD83D ...) and sorts before
        // U+E000 in UTF-16, although its UTF-8 bytes sort after.
        let value = json!({ "\u{E000}": 1, "\u{1F600}": 2, "a": 0 });
        assert_eq!(canonical_json(&value).unwrap(), "{\"a\":0,\"\u{1F600}\":2,\"\u{E000}\":1}");
    }

    #[test]
    fn test_forbidden_callee_order_is_significant() {
        let a = json!({ "forbidden_callees": ["planner", "auditor"] });
        let b = json!({ "forbidden_callees": ["auditor", "planner"] });
        assert_ne!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_descriptor_digest_ignores_field_order() {
        let descriptor = SpecialistDescriptor::new("reviewer", "review").with_token_budget(2_000);
        let mut reordered = serde_json::Map::new();
        let value = serde_json::to_value(&descriptor).unwrap();
        let mut fields: Vec<_> = value.as_object().unwrap().iter().collect();
        fields.reverse();
        for (k, v) in fields {
            reordered.insert(k.clone(), v.clone());
        }

        let direct = digest_of(&descriptor).unwrap();
        assert_eq!(direct.len(), 64);
        assert_eq!(direct, compute_digest(&Value::Object(reordered)).unwrap());
        assert_ne!(direct, digest_of(&descriptor.clone().with_token_budget(2_001)).unwrap());
    }
}
