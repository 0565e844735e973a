//! Identity directory
//!
//! Maps usernames to opaque user ids and to public keys. A user may have any
//! number of keys but at most one is active; verifiers only ever read the
//! active one.

pub mod memory;
pub mod sql;

pub use memory::MemoryDirectory;
pub use sql::SqlIdentityDirectory;

use crate::crypto::EcJwk;
use crate::db::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 30;

/// Opaque user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn generate() -> Self {
        UserId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored public key of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub id: i64,
    pub user_id: UserId,
    pub jwk: EcJwk,
    pub fingerprint: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("User {0} has no active public key")]
    NoActiveKey(String),

    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Key {0} not found")]
    KeyNotFound(i64),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<DbError> for IdentityError {
    fn from(err: DbError) -> Self {
        IdentityError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for IdentityError {
    fn from(err: rusqlite::Error) -> Self {
        IdentityError::Storage(err.to_string())
    }
}

/// Usernames are 3-30 characters of ASCII letters, digits, `_`, `-` or `.`, case-sensitive
pub fn validate_username(username: &str) -> Result<(), IdentityError> {
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(IdentityError::InvalidUsername(format!(
            "{:?} must be {}-{} characters",
            username, USERNAME_MIN_LEN, USERNAME_MAX_LEN
        )));
    }
    if let Some(bad) = username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(IdentityError::InvalidUsername(format!(
            "{:?} contains {:?}",
            username, bad
        )));
    }
    Ok(())
}

/// Only public, on-curve keys are accepted into the directory
pub(crate) fn check_public_key(jwk: &EcJwk) -> Result<EcJwk, IdentityError> {
    jwk.to_public_key()
        .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
    Ok(jwk.public_only())
}

/// Lookup and administration of user identities
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Active public key of `username`
    async fn resolve_public_key(&self, username: &str) -> Result<EcJwk, IdentityError> {
        Ok(self.active_key(username).await?.jwk)
    }

    async fn resolve_user_id(&self, username: &str) -> Result<UserId, IdentityError>;

    /// The full record of the currently active key
    async fn active_key(&self, username: &str) -> Result<PublicKeyRecord, IdentityError>;

    async fn user_count(&self) -> Result<usize, IdentityError>;

    /// Create a user whose first key is immediately active
    async fn register_user(&self, username: &str, public_key: &EcJwk) -> Result<UserId, IdentityError>;

    /// Add a key and make it the only active one
    async fn add_public_key(
        &self,
        username: &str,
        public_key: &EcJwk,
    ) -> Result<PublicKeyRecord, IdentityError>;

    async fn deactivate_key(&self, username: &str, key_id: i64) -> Result<(), IdentityError>;

    /// All keys of a user, oldest first
    async fn list_keys(&self, username: &str) -> Result<Vec<PublicKeyRecord>, IdentityError>;
}
