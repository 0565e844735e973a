//! Deterministic key derivation
//!
//! A user's secp256k1 key pair is recomputed from `(username, passphrase)` at
//! every login instead of being stored. Re-deriving from the same inputs must
//! always produce byte-identical keys.
//!
//! ```text
//! H1 = SHA256(username ":" passphrase)
//! H2 = SHA256(passphrase ":" username)
//! X  = H1 XOR H2
//! for i in 0..32:                      (left to right, uses the already-mixed X[i-1])
//!     X[i] = X[i]^2 + X[i] + 41        (mod 256)
//!     if i > 0: X[i] = X[i] + 7*X[i-1] (mod 256)
//! sk = SHA256(X), rehashed until it is a valid scalar
//! ```
//!
//! Secret bytes are zeroized on drop.

use super::error::{CryptoError, CryptoResult};
use super::jwk::EcJwk;
use crate::codec::bytes_to_hex;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, SecretKey};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::warn;
use zeroize::Zeroizing;

/// Upper bound on rehash attempts when a digest is not a valid scalar.
/// Reaching it would take ~2^-128 odds per attempt.
const MAX_SCALAR_ATTEMPTS: usize = 16;

/// Derived key pair in JWK form, plus the raw scalar for signing
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: EcJwk,
    pub public_key: EcJwk,
    secret: Zeroizing<[u8; 32]>,
}

/// Hex views of a key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexKeys {
    pub private_key: String,
    pub public_key: String,
    pub public_key_uncompressed: String,
}

impl KeyPair {
    fn from_secret(secret_key: &SecretKey) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&secret_key.to_bytes());
        Self {
            private_key: EcJwk::from_secret_key(secret_key),
            public_key: EcJwk::from_public_key(&secret_key.public_key()),
            secret,
        }
    }

    /// Raw 32-byte big-endian scalar (use carefully!)
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Private scalar, compressed public key and uncompressed public key as hex
    pub fn hex(&self) -> CryptoResult<HexKeys> {
        let secret_key = SecretKey::from_bytes(&FieldBytes::from(*self.secret))
            .map_err(|_| CryptoError::InvalidKey("scalar out of range".to_string()))?;
        let public = secret_key.public_key();
        Ok(HexKeys {
            private_key: bytes_to_hex(self.secret.as_slice()),
            public_key: bytes_to_hex(public.to_encoded_point(true).as_bytes()),
            public_key_uncompressed: bytes_to_hex(public.to_encoded_point(false).as_bytes()),
        })
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.private_key == other.private_key && self.public_key == other.public_key
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The mixed 32-byte seed before the final hash
fn mix_seed(username: &str, passphrase: &str) -> Zeroizing<[u8; 32]> {
    let h1 = Sha256::digest(format!("{}:{}", username, passphrase).as_bytes());
    let h2 = Sha256::digest(format!("{}:{}", passphrase, username).as_bytes());

    let mut x = Zeroizing::new([0u8; 32]);
    for i in 0..32 {
        x[i] = h1[i] ^ h2[i];
    }

    for i in 0..32 {
        let v = x[i];
        x[i] = v.wrapping_mul(v).wrapping_add(v).wrapping_add(41);
        if i > 0 {
            x[i] = x[i].wrapping_add(x[i - 1].wrapping_mul(7));
        }
    }
    x
}

/// Derive the private scalar bytes for `(username, passphrase)`
pub fn derive_private_key(username: &str, passphrase: &str) -> CryptoResult<SecretKey> {
    if username.is_empty() || passphrase.is_empty() {
        return Err(CryptoError::KeyDerivation(
            "username and passphrase must be non-empty".to_string(),
        ));
    }

    let seed = mix_seed(username, passphrase);
    let mut candidate = Zeroizing::new([0u8; 32]);
    candidate.copy_from_slice(&Sha256::digest(seed.as_slice()));

    for attempt in 0..MAX_SCALAR_ATTEMPTS {
        match SecretKey::from_bytes(&FieldBytes::from(*candidate)) {
            Ok(secret) => return Ok(secret),
            Err(_) => {
                warn!(attempt, "Derived scalar out of range, rehashing");
                let next = Sha256::digest(candidate.as_slice());
                candidate.copy_from_slice(&next);
            }
        }
    }

    Err(CryptoError::KeyDerivation(format!(
        "no valid scalar after {} attempts",
        MAX_SCALAR_ATTEMPTS
    )))
}

/// Derive the full key pair for `(username, passphrase)`
pub fn derive_key_pair(username: &str, passphrase: &str) -> CryptoResult<KeyPair> {
    let secret = derive_private_key(username, passphrase)?;
    Ok(KeyPair::from_secret(&secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_key_pair("alice", "correct horse").unwrap();
        let b = derive_key_pair("alice", "correct horse").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.secret_bytes(), b.secret_bytes());
    }

    #[test]
    fn test_inputs_are_not_symmetric_across_users() {
        let a = derive_key_pair("alice", "pw1").unwrap();
        let b = derive_key_pair("alice", "pw2").unwrap();
        let c = derive_key_pair("bob", "pw1").unwrap();
        assert_ne!(a.public_key, b.public_key);
        assert_ne!(a.public_key, c.public_key);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(matches!(
            derive_key_pair("", "pw"),
            Err(CryptoError::KeyDerivation(_))
        ));
        assert!(matches!(
            derive_key_pair("alice", ""),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_mix_seed_swapped_inputs_collide() {
        // Swapping username and passphrase leaves H1 XOR H2 unchanged.
        assert_eq!(*mix_seed("a", "b"), *mix_seed("b", "a"));
        assert_ne!(*mix_seed("a", "b"), *mix_seed("a", "c"));
    }

    #[test]
    fn test_mix_seed_chain_matches_reference_loop() {
        let h1 = Sha256::digest(b"carol:secret");
        let h2 = Sha256::digest(b"secret:carol");
        let mut expected = [0u32; 32];
        for i in 0..32 {
            let x = (h1[i] ^ h2[i]) as u32;
            expected[i] = (x * x + x + 41) % 256;
            if i > 0 {
                expected[i] = (expected[i] + expected[i - 1] * 7) % 256;
            }
        }
        let seed = mix_seed("carol", "secret");
        for i in 0..32 {
            assert_eq!(seed[i] as u32, expected[i], "byte {} differs", i);
        }
    }

    #[test]
    fn test_public_key_matches_private_scalar() {
        let kp = derive_key_pair("dave", "hunter2").unwrap();
        let secret = kp.private_key.to_secret_key().unwrap();
        assert_eq!(EcJwk::from_public_key(&secret.public_key()), kp.public_key);
        assert_eq!(kp.private_key.public_only(), kp.public_key);
    }

    #[test]
    fn test_hex_views() {
        let kp = derive_key_pair("erin", "pw").unwrap();
        let hex = kp.hex().unwrap();
        assert_eq!(hex.private_key.len(), 64);
        assert_eq!(hex.public_key.len(), 66);
        assert!(hex.public_key_uncompressed.starts_with("04"));
        assert_eq!(hex.public_key_uncompressed.len(), 130);
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let kp = derive_key_pair("frank", "pw").unwrap();
        let debug = format!("{:?}", kp);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&bytes_to_hex(kp.secret_bytes())));
    }

    #[test]
    fn test_public_key_can_be_moved_out() {
        let kp = derive_key_pair("grace", "pw").unwrap();
        let expected = kp.private_key.public_only();
        let public = kp.public_key;
        assert_eq!(public, expected);
    }
}
