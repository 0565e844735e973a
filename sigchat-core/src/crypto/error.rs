//! Error types for key derivation, signing and verification

use crate::codec::CodecError;
use thiserror::Error;

/// Result type for key and signing operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised while deriving keys or producing signatures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The derived bytes never yielded a valid secp256k1 scalar, or the input was empty
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// No private key could be obtained from the caller's session
    #[error("Private key unavailable: {0}")]
    KeyUnavailable(String),

    /// The EC primitive rejected the operation
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Key material is malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure to obtain a sender's public key
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyResolutionError {
    #[error("No public key found for {0}")]
    NotFound(String),

    #[error("Key lookup failed: {0}")]
    Network(String),

    #[error("Invalid key response: {0}")]
    InvalidResponse(String),
}

/// Reasons a signed envelope fails verification.
///
/// These never cross the verifier's public boundary as errors from
/// [`Verifier::verify`](super::Verifier::verify); they are reported for logging.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Key resolution failed: {0}")]
    KeyResolution(#[from] KeyResolutionError),

    #[error("Hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: String, computed: String },

    #[error("Signature does not match")]
    SignatureInvalid,

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Malformed public key: {0}")]
    MalformedKey(String),
}
