//! Delivery errors. Each one aborts only the frame being processed and is
//! reported to the sending connection as an `error` frame.

use crate::identity::IdentityError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Recipient does not exist
    #[error("Unknown recipient: {0}")]
    Routing(String),

    #[error("Failed to store message: {0}")]
    Persistence(#[from] StoreError),

    #[error("Connection closed: {0}")]
    Transport(String),

    /// The other side is not draining its queue
    #[error("Recipient busy: {0}")]
    Backpressure(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Username \"{0}\" is already in use")]
    AlreadyConnected(String),

    #[error("Unknown user: {0}")]
    UnknownIdentity(String),

    #[error("Identify before sending messages")]
    NotIdentified,

    #[error("Identity lookup failed: {0}")]
    Identity(String),
}

impl DeliveryError {
    /// Map a directory error for the recipient side of a route
    pub(crate) fn for_recipient(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser(name) => DeliveryError::Routing(name),
            other => DeliveryError::Identity(other.to_string()),
        }
    }

    /// Map a directory error for the identifying side of a connection
    pub(crate) fn for_identify(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser(name) => DeliveryError::UnknownIdentity(name),
            other => DeliveryError::Identity(other.to_string()),
        }
    }
}

/// Listener failures that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage setup failed: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_mapping() {
        let err = DeliveryError::for_recipient(IdentityError::UnknownUser("zed".to_string()));
        assert!(matches!(err, DeliveryError::Routing(ref name) if name == "zed"));

        let err = DeliveryError::for_identify(IdentityError::UnknownUser("zed".to_string()));
        assert_eq!(err.to_string(), "Unknown user: zed");

        let err = DeliveryError::for_identify(IdentityError::Storage("disk".to_string()));
        assert!(matches!(err, DeliveryError::Identity(_)));
    }

    #[test]
    fn test_collision_message() {
        let err = DeliveryError::AlreadyConnected("bob".to_string());
        assert_eq!(err.to_string(), "Username \"bob\" is already in use");
    }
}
