//! EC key records in JWK form
//!
//! Coordinates and the private scalar are base64url (no padding). The same
//! record shape is stored by the identity directory and served over HTTP.

use super::error::{CryptoError, CryptoResult};
use crate::codec::{base64url_to_bytes, bytes_to_base64url, bytes_to_hex};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_TYPE_EC: &str = "EC";
pub const CURVE_SECP256K1: &str = "secp256k1";

/// JWK-style EC key record. `d` is only present on the private half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default = "default_ext")]
    pub ext: bool,
}

fn default_ext() -> bool {
    true
}

impl EcJwk {
    /// Build the public record for a curve point
    pub fn from_public_key(public: &PublicKey) -> Self {
        let point = public.to_encoded_point(false);
        // Uncompressed points of a valid key always carry both coordinates.
        let x = point.x().map(|x| bytes_to_base64url(x)).unwrap_or_default();
        let y = point.y().map(|y| bytes_to_base64url(y)).unwrap_or_default();
        Self {
            kty: KEY_TYPE_EC.to_string(),
            crv: CURVE_SECP256K1.to_string(),
            x,
            y,
            d: None,
            ext: true,
        }
    }

    /// Build the private record (public coordinates plus `d`)
    pub fn from_secret_key(secret: &SecretKey) -> Self {
        let mut jwk = Self::from_public_key(&secret.public_key());
        jwk.d = Some(bytes_to_base64url(&secret.to_bytes()));
        jwk
    }

    /// Parse a JWK from its JSON text
    pub fn from_json(json: &str) -> CryptoResult<Self> {
        let jwk: Self = serde_json::from_str(json)
            .map_err(|e| CryptoError::InvalidKey(format!("bad JWK json: {}", e)))?;
        jwk.check_curve()?;
        Ok(jwk)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// Strip the private scalar
    pub fn public_only(&self) -> Self {
        Self { d: None, ..self.clone() }
    }

    fn check_curve(&self) -> CryptoResult<()> {
        if self.kty != KEY_TYPE_EC || self.crv != CURVE_SECP256K1 {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        Ok(())
    }

    /// `0x04 || x || y`
    pub fn to_uncompressed_point(&self) -> CryptoResult<[u8; 65]> {
        self.check_curve()?;
        let x = base64url_to_bytes(&self.x)?;
        let y = base64url_to_bytes(&self.y)?;
        if x.len() != 32 || y.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "coordinates must be 32 bytes (x={}, y={})",
                x.len(),
                y.len()
            )));
        }
        let mut point = [0u8; 65];
        point[0] = 0x04;
        point[1..33].copy_from_slice(&x);
        point[33..].copy_from_slice(&y);
        Ok(point)
    }

    /// Parse the coordinates into a curve point, rejecting points not on the curve
    pub fn to_public_key(&self) -> CryptoResult<PublicKey> {
        let point = self.to_uncompressed_point()?;
        PublicKey::from_sec1_bytes(&point)
            .map_err(|e| CryptoError::InvalidKey(format!("point not on curve: {}", e)))
    }

    /// Parse the private scalar
    pub fn to_secret_key(&self) -> CryptoResult<SecretKey> {
        self.check_curve()?;
        let d = self
            .d
            .as_deref()
            .ok_or_else(|| CryptoError::KeyUnavailable("JWK has no private scalar".to_string()))?;
        let bytes = Zeroizing::new(base64url_to_bytes(d)?);
        let scalar: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("private scalar must be 32 bytes, got {}", bytes.len()))
        })?;
        SecretKey::from_bytes(&FieldBytes::from(scalar))
            .map_err(|_| CryptoError::InvalidKey("scalar out of range".to_string()))
    }

    /// Hex SHA-256 of the uncompressed point
    pub fn fingerprint(&self) -> CryptoResult<String> {
        let point = self.to_uncompressed_point()?;
        Ok(bytes_to_hex(&Sha256::digest(point)))
    }
}

impl fmt::Debug for EcJwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcJwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &self.d.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
