//! Canonical serialization and content hashing.
//!
//! Structurally equal values always produce the same bytes:
//! ```text
//! {"b":1,"a":[2,{"d":0,"c":1}]}   ──►   {"a":[2,{"c":1,"d":0}],"b":1}
//! ```
//! - object keys sorted by byte value, at every depth
//! - arrays keep element order
//! - compact output (no whitespace)
//!
//! The digest is SHA-256 over the canonical UTF-8 bytes, rendered as 64
//! lowercase hex characters, so hashes are comparable across replicas.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a rendered digest in characters.
pub const DIGEST_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value cannot be represented as a structured value.
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Serialize `value` into its canonical JSON form.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encoding(e.to_string()))?;
    let mut out = String::with_capacity(64);
    write_value(&value, &mut out)?;
    Ok(out)
}

/// Digest of the canonical form of `value`.
pub fn hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    Ok(digest(&canonicalize(value)?))
}

/// SHA-256 of `data`, lowercase hex.
pub fn digest(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Parse a canonical payload back into a structured value.
pub fn decode(canonical: &str) -> Result<Value, CodecError> {
    serde_json::from_str(canonical).map_err(|e| CodecError::Encoding(e.to_string()))
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Sorted explicitly: serde_json's map order depends on crate features.
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String(key.clone()), out)?;
                out.push(':');
                write_value(item, out)?;
            }
            out.push('}');
        }
        scalar => write_scalar(scalar, out)?,
    }
    Ok(())
}

fn write_scalar(value: &Value, out: &mut String) -> Result<(), CodecError> {
    let text = serde_json::to_string(value).map_err(|e| CodecError::Encoding(e.to_string()))?;
    out.push_str(&text);
    Ok(())
}
