//! Signed-message chat core
//!
//! Deterministic key derivation, fixed-order message hashing, secp256k1
//! signing and verification, a store-and-forward WebSocket delivery server,
//! and the client runtime that re-verifies every received message.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod db;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod store;

pub use config::Config;
pub use crypto::{derive_key_pair, KeyPair, SignedEnvelope, Verifier};
pub use logging::{init_logging, LogLevel};
pub use protocol::{ClientFrame, MessageStatus, ServerFrame};
