//! Keys, signatures and verification
//!
//! ```text
//!  (username, passphrase)
//!          │ derive_key_pair
//!          ▼
//!       KeyPair ──── sign_envelope ────► SignedEnvelope ──── wire ───┐
//!                                                                   ▼
//!  KeySource ──► PublicKeyCache ──► Verifier::verify(envelope, force_refresh) ──► bool
//! ```

pub mod envelope;
pub mod error;
pub mod jwk;
pub mod key_cache;
pub mod key_derivation;
pub mod key_source;
pub mod signing;
pub mod verification;

pub use envelope::{create_message_hash, EnvelopeSignature, SignedEnvelope};
pub use error::{CryptoError, CryptoResult, KeyResolutionError, VerificationError};
pub use jwk::EcJwk;
pub use key_cache::{FetchTicket, PublicKeyCache, DEFAULT_KEY_TTL};
pub use key_derivation::{derive_key_pair, derive_private_key, HexKeys, KeyPair};
pub use key_source::{DirectoryKeySource, HttpKeySource, KeySource};
pub use signing::{now_timestamp, sign_envelope, sign_envelope_at, sign_message_hash, SigningSession};
pub use verification::{verify_with_key, Verifier};
