// crates/elspeth-core/src/core/hashing.rs
// ============================================================================
// Module: Canonical Hashing
// Description: RFC 8785 JSON canonicalization and content hashing utilities.
// Purpose: Provide deterministic hashes for rows, contracts, and payloads.
// Dependencies: serde, serde_jcs, sha2
// ============================================================================

//! ## Overview
//! Elspeth hashes all canonical JSON using RFC 8785 (JCS) to guarantee
//! stable, replayable digests. The hash is the cornerstone of payload
//! deduplication and audit integrity.

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

/// Inclusive bound on integers representable losslessly as canonical JSON
/// numbers (2^53 - 1), matching the `OutOfRange` rule in the specification.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

/// Errors raised while producing a canonical hash.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    /// The value contained a non-finite float (`NaN` or `Inf`).
    #[error("value contains a non-finite number at {path}")]
    InvalidValue {
        /// JSON-pointer-ish path to the offending value.
        path: String,
    },
    /// The value contained an integer outside `±(2^53 - 1)`.
    #[error("integer at {path} is out of the safe canonical range")]
    OutOfRange {
        /// JSON-pointer-ish path to the offending value.
        path: String,
    },
    /// Serialization to JSON failed before canonicalization could run.
    #[error("failed to serialize value: {0}")]
    Serialization(String),
}

/// Lowercase hex-encoded SHA-256 digest.
pub type HexHash = String;

/// Walks a [`serde_json::Value`] rejecting non-finite floats and
/// out-of-range integers before canonicalization is attempted, so that
/// violations are reported with a path rather than surfacing as an opaque
/// canonicalization failure.
fn check_finite_and_range(value: &serde_json::Value, path: &str) -> Result<(), HashError> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(HashError::InvalidValue {
                        path: path.to_string(),
                    });
                }
            }
            if let Some(i) = n.as_i64() {
                if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
                    return Err(HashError::OutOfRange {
                        path: path.to_string(),
                    });
                }
            } else if let Some(u) = n.as_u64() {
                if u > MAX_SAFE_INTEGER as u64 {
                    return Err(HashError::OutOfRange {
                        path: path.to_string(),
                    });
                }
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                check_finite_and_range(item, &format!("{path}/{idx}"))?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                check_finite_and_range(item, &format!("{path}/{key}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Returns canonical JSON bytes for a serializable value per RFC 8785.
///
/// # Errors
///
/// Returns [`HashError::InvalidValue`] on `NaN`/`Inf`, [`HashError::OutOfRange`]
/// on integers outside `±(2^53 - 1)`, and [`HashError::Serialization`] if the
/// value cannot be serialized to JSON at all.
///
/// `serde_json::Value` silently maps non-finite floats to `null`, so
/// finiteness is checked against the direct text serialization (which
/// `serde_json` itself refuses for `NaN`/`Inf`) before the value is ever
/// converted to `Value` for the integer-range and canonicalization passes.
pub fn canonical_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    let direct = serde_json::to_vec(value).map_err(|err| {
        let message = err.to_string();
        if message.contains("NaN") || message.contains("infinite") {
            HashError::InvalidValue {
                path: String::new(),
            }
        } else {
            HashError::Serialization(message)
        }
    })?;
    let as_value: serde_json::Value =
        serde_json::from_slice(&direct).map_err(|err| HashError::Serialization(err.to_string()))?;
    check_finite_and_range(&as_value, "")?;
    serde_jcs::to_vec(&as_value).map_err(|err| HashError::Serialization(err.to_string()))
}

/// Hashes raw bytes with SHA-256, returning a lowercase hex digest.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> HexHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Hashes the canonical JSON form of a serializable value.
///
/// # Errors
///
/// See [`canonical_json_bytes`].
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<HexHash, HashError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Encodes bytes as a lowercase hex string.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_hash_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(stable_hash(&a).expect("hash"), stable_hash(&b).expect("hash"));
    }

    #[test]
    fn stable_hash_differs_on_content_change() {
        let a = stable_hash(&json!({"a": 1})).expect("hash");
        let b = stable_hash(&json!({"a": 2})).expect("hash");
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_non_finite_floats() {
        #[derive(Serialize)]
        struct Wrapper {
            n: f64,
        }
        let err = canonical_json_bytes(&Wrapper { n: f64::NAN }).expect_err("NaN must be rejected");
        assert!(matches!(err, HashError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_out_of_range_integers() {
        let value = json!({"n": MAX_SAFE_INTEGER + 1});
        let err = canonical_json_bytes(&value).expect_err("out of range must be rejected");
        assert!(matches!(err, HashError::OutOfRange { .. }));
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
