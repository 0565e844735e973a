//! Signing engine
//!
//! Deterministic-nonce ECDSA (RFC 6979, HMAC-SHA256) over the message hash,
//! so signing the same hash with the same key always yields the same `(r, s)`.
//! Signatures are low-S normalized.

use super::envelope::{create_message_hash, EnvelopeSignature, SignedEnvelope};
use super::error::{CryptoError, CryptoResult};
use super::jwk::EcJwk;
use super::key_derivation::{derive_key_pair, KeyPair};
use crate::codec::{bytes_to_hex, hex_to_array};
use chrono::{SecondsFormat, Utc};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use tracing::debug;

/// Current time as ISO-8601 with millisecond precision, e.g. `2025-01-01T12:00:00.000Z`
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn signing_key_from(private_key: &EcJwk) -> CryptoResult<SigningKey> {
    let secret = private_key.to_secret_key()?;
    Ok(SigningKey::from(secret))
}

/// Sign a hex-encoded 32-byte message hash
pub fn sign_message_hash(message_hash: &str, private_key: &EcJwk) -> CryptoResult<EnvelopeSignature> {
    let digest: [u8; 32] = hex_to_array(message_hash)?;
    let signing_key = signing_key_from(private_key)?;

    let signature: Signature = signing_key
        .sign_prehash(&digest)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

    let compact = signature.to_bytes();
    Ok(EnvelopeSignature {
        r: bytes_to_hex(&compact[..32]),
        s: bytes_to_hex(&compact[32..]),
    })
}

/// Build and sign an envelope with an explicit timestamp
pub fn sign_envelope_at(
    sender_username: &str,
    receiver_username: &str,
    plaintext_message: &str,
    timestamp: &str,
    private_key: &EcJwk,
) -> CryptoResult<SignedEnvelope> {
    let message_hash =
        create_message_hash(sender_username, receiver_username, plaintext_message, timestamp);
    let signature = sign_message_hash(&message_hash, private_key)?;

    debug!(
        sender = sender_username,
        receiver = receiver_username,
        hash = %message_hash,
        "Signed message"
    );

    Ok(SignedEnvelope {
        sender_username: sender_username.to_string(),
        receiver_username: receiver_username.to_string(),
        plaintext_message: plaintext_message.to_string(),
        message_hash,
        signature,
        timestamp: timestamp.to_string(),
    })
}

/// Build and sign an envelope stamped with the current time
pub fn sign_envelope(
    sender_username: &str,
    receiver_username: &str,
    plaintext_message: &str,
    private_key: &EcJwk,
) -> CryptoResult<SignedEnvelope> {
    sign_envelope_at(
        sender_username,
        receiver_username,
        plaintext_message,
        &now_timestamp(),
        private_key,
    )
}

/// Holds the key pair derived at login for the lifetime of a user session
#[derive(Debug, Default)]
pub struct SigningSession {
    username: Option<String>,
    key_pair: Option<KeyPair>,
}

impl SigningSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and hold the key pair for `(username, passphrase)`
    pub fn login(&mut self, username: &str, passphrase: &str) -> CryptoResult<&KeyPair> {
        let key_pair = derive_key_pair(username, passphrase)?;
        self.username = Some(username.to_string());
        Ok(self.key_pair.insert(key_pair))
    }

    pub fn logout(&mut self) {
        self.username = None;
        self.key_pair = None;
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.key_pair.as_ref()
    }

    /// Sign a message from the logged-in user
    pub fn sign(&self, receiver_username: &str, plaintext_message: &str) -> CryptoResult<SignedEnvelope> {
        let (username, key_pair) = match (&self.username, &self.key_pair) {
            (Some(u), Some(kp)) => (u, kp),
            _ => {
                return Err(CryptoError::KeyUnavailable(
                    "no key derived for this session".to_string(),
                ))
            }
        };
        sign_envelope(username, receiver_username, plaintext_message, &key_pair.private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-03-10T08:30:00.000Z";

    #[test]
    fn test_signature_is_deterministic() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let a = sign_envelope_at("alice", "bob", "hello", TS, &kp.private_key).unwrap();
        let b = sign_envelope_at("alice", "bob", "hello", TS, &kp.private_key).unwrap();
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.signature.r.len(), 64);
        assert_eq!(a.signature.s.len(), 64);
    }

    #[test]
    fn test_envelope_hash_matches_fields() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let env = sign_envelope_at("alice", "bob", "hello", TS, &kp.private_key).unwrap();
        assert!(env.hash_is_consistent());
        assert_eq!(env.timestamp, TS);
    }

    #[test]
    fn test_public_key_cannot_sign() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        let err = sign_envelope_at("alice", "bob", "x", TS, &kp.public_key).unwrap_err();
        assert!(matches!(err, CryptoError::KeyUnavailable(_)));
    }

    #[test]
    fn test_bad_hash_rejected() {
        let kp = derive_key_pair("alice", "pw").unwrap();
        assert!(matches!(
            sign_message_hash("abcd", &kp.private_key),
            Err(CryptoError::Codec(_))
        ));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        // YYYY-MM-DDTHH:MM:SS.mmmZ
        assert_eq!(ts.len(), 24);
        assert_eq!(&ts[19..20], ".");
    }

    #[test]
    fn test_session_requires_login() {
        let mut session = SigningSession::new();
        assert!(matches!(
            session.sign("bob", "hi"),
            Err(CryptoError::KeyUnavailable(_))
        ));

        session.login("alice", "pw").unwrap();
        let env = session.sign("bob", "hi").unwrap();
        assert_eq!(env.sender_username, "alice");

        session.logout();
        assert!(session.key_pair().is_none());
        assert!(session.sign("bob", "hi").is_err());
    }
}
