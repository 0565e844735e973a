//! Byte, hex and base64url conversions plus the JSON serializations used by
//! every other component.
//!
//! Two JSON forms exist and must not be confused:
//! - [`message_hash_input`] emits the four signed fields in a *fixed* order.
//!   Signer and verifier both go through it, so this order is load-bearing.
//! - [`canonicalize_json`] emits key-sorted JSON for audit dumps and debugging.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid base64url string: {0}")]
    InvalidBase64(String),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Lower-case hex encoding
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string. Empty and odd-length input is rejected.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CodecError> {
    if hex_str.is_empty() || hex_str.len() % 2 != 0 {
        return Err(CodecError::InvalidHex(format!("bad length {}", hex_str.len())));
    }
    hex::decode(hex_str).map_err(|e| CodecError::InvalidHex(e.to_string()))
}

/// Decode a hex string that must hold exactly `N` bytes
pub fn hex_to_array<const N: usize>(hex_str: &str) -> Result<[u8; N], CodecError> {
    let bytes = hex_to_bytes(hex_str)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CodecError::InvalidLength { expected: N, actual })
}

/// Base64url without padding, as used for JWK coordinates
pub fn bytes_to_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Base64url decoding; trailing `=` padding is tolerated
pub fn base64url_to_bytes(input: &str) -> Result<Vec<u8>, CodecError> {
    if input.is_empty() {
        return Err(CodecError::InvalidBase64("empty input".to_string()));
    }
    if input.ends_with('=') {
        URL_SAFE.decode(input)
    } else {
        URL_SAFE_NO_PAD.decode(input)
    }
    .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}

pub fn hex_to_base64url(hex_str: &str) -> Result<String, CodecError> {
    Ok(bytes_to_base64url(&hex_to_bytes(hex_str)?))
}

pub fn base64url_to_hex(input: &str) -> Result<String, CodecError> {
    Ok(bytes_to_hex(&base64url_to_bytes(input)?))
}

/// The four signed fields, serialized in declaration order.
#[derive(Serialize)]
struct HashInput<'a> {
    sender_username: &'a str,
    receiver_username: &'a str,
    plaintext_message: &'a str,
    timestamp: &'a str,
}

/// Fixed-order JSON for the message hash.
///
/// Produces `{"sender_username":..,"receiver_username":..,"plaintext_message":..,"timestamp":..}`
/// with the same string escaping as ECMAScript `JSON.stringify`.
pub fn message_hash_input(
    sender_username: &str,
    receiver_username: &str,
    plaintext_message: &str,
    timestamp: &str,
) -> String {
    let input = HashInput {
        sender_username,
        receiver_username,
        plaintext_message,
        timestamp,
    };
    // Serializing a struct of &str fields cannot fail.
    serde_json::to_string(&input).unwrap_or_default()
}

/// Key-sorted, whitespace-free JSON
pub fn canonicalize_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonicalize_json(&map[key.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0x00, 0x0f, 0xab, 0xff];
        let encoded = bytes_to_hex(&bytes);
        assert_eq!(encoded, "000fabff");
        assert_eq!(hex_to_bytes(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(hex_to_bytes("").is_err());
        assert!(hex_to_bytes("abc").is_err());
        assert!(hex_to_bytes("zz").is_err());
    }

    #[test]
    fn test_hex_to_array_length() {
        let arr: [u8; 2] = hex_to_array("beef").unwrap();
        assert_eq!(arr, [0xbe, 0xef]);

        let err = hex_to_array::<4>("beef").unwrap_err();
        assert_eq!(err, CodecError::InvalidLength { expected: 4, actual: 2 });
    }

    #[test]
    fn test_base64url_alphabet_and_padding() {
        // 0xfb 0xff encodes to "+/8=" in standard base64
        let encoded = bytes_to_base64url(&[0xfb, 0xff]);
        assert_eq!(encoded, "-_8");
        assert_eq!(base64url_to_bytes("-_8").unwrap(), vec![0xfb, 0xff]);
        assert_eq!(base64url_to_bytes("-_8=").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn test_hex_base64url_bridge() {
        let b64 = hex_to_base64url("deadbeef").unwrap();
        assert_eq!(base64url_to_hex(&b64).unwrap(), "deadbeef");
        assert!(base64url_to_hex("").is_err());
    }

    #[test]
    fn test_message_hash_input_field_order() {
        let s = message_hash_input("alice", "bob", "hi", "2024-01-01T00:00:00.000Z");
        assert_eq!(
            s,
            r#"{"sender_username":"alice","receiver_username":"bob","plaintext_message":"hi","timestamp":"2024-01-01T00:00:00.000Z"}"#
        );
    }

    #[test]
    fn test_message_hash_input_escaping() {
        let s = message_hash_input("a", "b", "line\n\"quoted\"\t\u{1}é", "t");
        assert!(s.contains(r#""plaintext_message":"line\n\"quoted\"\t\u0001é""#));
    }

    #[test]
    fn test_canonicalize_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "s"}});
        assert_eq!(
            canonicalize_json(&value),
            r#"{"a":{"c":"s","z":[3,{"x":null,"y":true}]},"b":1}"#
        );
    }
}
