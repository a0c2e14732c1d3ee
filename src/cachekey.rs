//! Deterministic cache key generation.
//!
//! A cache key is the SHA-256 over a canonical byte encoding of the key
//! dictionary: mappings are serialized with their keys in lexicographic
//! order and without any insignificant whitespace, so the key depends only
//! on the dictionary's contents, never on insertion order or on the YAML
//! formatting the inputs were loaded from.

use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// Bumped whenever the artifact layout or the key dictionary itself changes
/// in a way that invalidates all previously produced artifacts.
pub const CORE_ARTIFACT_VERSION: u32 = 5;

/// Generates the hex cache key for a canonical dictionary.
pub fn generate_key(value: &Value) -> String {
    let mut bytes = Vec::with_capacity(256);
    write_canonical(value, &mut bytes);
    hex::encode(Sha256::digest(&bytes))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => {
            // serde_json escapes deterministically.
            out.extend_from_slice(
                serde_json::to_string(s).expect("string serialization is infallible").as_bytes(),
            );
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(
                    serde_json::to_string(key).expect("string serialization is infallible").as_bytes(),
                );
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
    }
}

/// The `execution-environment` subkey: artifacts are only interchangeable
/// between hosts with the same OS and machine architecture.
pub fn execution_environment() -> Value {
    serde_json::json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}
