//! Verification engine
//!
//! `verify` never fails across its boundary: every internal error becomes
//! `false` plus a logged reason. Callers that want the reason use
//! `verify_detailed`.

use super::envelope::SignedEnvelope;
use super::error::{KeyResolutionError, VerificationError};
use super::jwk::EcJwk;
use super::key_cache::PublicKeyCache;
use super::key_source::KeySource;
use crate::codec::hex_to_array;
use crate::metrics::{record_verification, Timer, VERIFICATION_DURATION_MS};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// Check an envelope against a known public key, with no I/O
pub fn verify_with_key(envelope: &SignedEnvelope, public_key: &EcJwk) -> Result<(), VerificationError> {
    let computed = envelope.compute_hash();
    if !computed.eq_ignore_ascii_case(&envelope.message_hash) {
        return Err(VerificationError::HashMismatch {
            claimed: envelope.message_hash.clone(),
            computed,
        });
    }

    let r: [u8; 32] = hex_to_array(&envelope.signature.r)
        .map_err(|e| VerificationError::MalformedSignature(format!("r: {}", e)))?;
    let s: [u8; 32] = hex_to_array(&envelope.signature.s)
        .map_err(|e| VerificationError::MalformedSignature(format!("s: {}", e)))?;
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&r);
    compact[32..].copy_from_slice(&s);
    let signature = Signature::from_slice(&compact)
        .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;

    let point = public_key
        .to_uncompressed_point()
        .map_err(|e| VerificationError::MalformedKey(e.to_string()))?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&point)
        .map_err(|e| VerificationError::MalformedKey(e.to_string()))?;

    let digest: [u8; 32] = hex_to_array(&computed)
        .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;

    verifying_key
        .verify_prehash(&digest, &signature)
        .map_err(|_| VerificationError::SignatureInvalid)
}

/// Resolves sender keys through a [`PublicKeyCache`] and checks envelopes
#[derive(Clone)]
pub struct Verifier {
    source: Arc<dyn KeySource>,
    cache: Arc<PublicKeyCache>,
}

impl Verifier {
    pub fn new(source: Arc<dyn KeySource>, cache: Arc<PublicKeyCache>) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &Arc<PublicKeyCache> {
        &self.cache
    }

    /// Key snapshot for one verification.
    ///
    /// A fetched key is returned to the caller directly; the cache is never
    /// re-read after the fetch, so a concurrent invalidation cannot swap the
    /// key out from under an in-flight verification.
    pub async fn resolve_key(
        &self,
        username: &str,
        force_refresh: bool,
    ) -> Result<EcJwk, KeyResolutionError> {
        if !force_refresh {
            if let Some(key) = self.cache.get(username) {
                debug!(username, "Using cached public key");
                return Ok(key);
            }
        }

        let ticket = self.cache.begin_fetch(username);
        let key = self.source.fetch_public_key(username).await?;
        if !self.cache.complete_fetch(ticket, key.clone()) {
            debug!(username, "Cache invalidated during fetch; key used once and not cached");
        }
        Ok(key)
    }

    pub async fn verify_detailed(
        &self,
        envelope: &SignedEnvelope,
        force_refresh: bool,
    ) -> Result<(), VerificationError> {
        let key = self.resolve_key(&envelope.sender_username, force_refresh).await?;
        verify_with_key(envelope, &key)
    }

    pub async fn verify(&self, envelope: &SignedEnvelope, force_refresh: bool) -> bool {
        let timer = Timer::new(VERIFICATION_DURATION_MS);
        let outcome = self.verify_detailed(envelope, force_refresh).await;
        timer.stop();
        record_verification(outcome.is_ok());
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    sender = %envelope.sender_username,
                    hash = %envelope.message_hash,
                    error = %e,
                    "Signature verification failed"
                );
                false
            }
        }
    }
}
