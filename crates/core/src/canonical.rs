//! Canonical JSON serialization
//!
//! Inter-service JSON is serialized with lexicographically sorted object
//! keys before it is signed or checksummed, so byte-for-byte comparison
//! is meaningful across services.

use serde::Serialize;
use serde_json::Value;

/// Serialize any value to its canonical JSON byte form.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_value(&value, &mut out);
    Ok(out)
}

/// Canonical JSON as a string, for logging and test assertions.
pub fn to_canonical_string<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let bytes = to_canonical_bytes(value)?;
    // write_value only emits output produced by serde_json, which is UTF-8.
    Ok(String::from_utf8(bytes).expect("canonical JSON is UTF-8"))
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(
                    serde_json::to_string(key)
                        .expect("string serializes")
                        .as_bytes(),
                );
                out.push(b':');
                write_value(&map[*key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        scalar => {
            out.extend_from_slice(
                serde_json::to_string(scalar)
                    .expect("scalar serializes")
                    .as_bytes(),
            );
        }
    }
}
