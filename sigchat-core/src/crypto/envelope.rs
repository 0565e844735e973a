//! Signed message envelope

use crate::codec::message_hash_input;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `r` and `s` halves of a compact secp256k1 signature, 32 bytes each, hex-encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub r: String,
    pub s: String,
}

/// A message with sender/receiver identity, plaintext, timestamp, hash and signature.
///
/// The field order here is also the JSON order on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub sender_username: String,
    pub receiver_username: String,
    pub plaintext_message: String,
    pub message_hash: String,
    pub signature: EnvelopeSignature,
    pub timestamp: String,
}

impl SignedEnvelope {
    /// SHA-256 over the fixed-order JSON of this envelope's own fields.
    /// The `message_hash` field is not consulted.
    pub fn compute_hash(&self) -> String {
        create_message_hash(
            &self.sender_username,
            &self.receiver_username,
            &self.plaintext_message,
            &self.timestamp,
        )
    }

    /// Whether the claimed hash matches the recomputed one
    pub fn hash_is_consistent(&self) -> bool {
        self.compute_hash().eq_ignore_ascii_case(&self.message_hash)
    }
}

/// Hex SHA-256 of the fixed-order message JSON
pub fn create_message_hash(
    sender_username: &str,
    receiver_username: &str,
    plaintext_message: &str,
    timestamp: &str,
) -> String {
    let input = message_hash_input(sender_username, receiver_username, plaintext_message, timestamp);
    hex::encode(Sha256::digest(input.as_bytes()))
}
