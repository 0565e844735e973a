//! Client-side error types

use crate::crypto::CryptoError;
use thiserror::Error;

/// Delivery transport failures on the client side. None of these are fatal:
/// the connection loop reconnects on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to the server")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conversation record is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the client coordinator
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Signing(#[from] CryptoError),

    #[error("Client coordinator stopped")]
    Stopped,
}
