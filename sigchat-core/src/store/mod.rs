//! Durable message store
//!
//! Single source of truth for delivery status. Every status transition is a
//! compare-and-set guarded by the expected prior status, and transitions only
//! move forward: `PENDING -> DELIVERED -> READ`.

pub mod memory;
pub mod sql;

pub use memory::MemoryMessageStore;
pub use sql::SqlMessageStore;

use crate::crypto::SignedEnvelope;
use crate::db::DbError;
use crate::identity::UserId;
pub use crate::protocol::MessageStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Status cannot move from {from} to {to}")]
    InvalidTransition { from: MessageStatus, to: MessageStatus },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A message about to be persisted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub envelope: SignedEnvelope,
}

/// A persisted message. The full envelope, including the signed timestamp,
/// is kept so it can be re-verified after delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub envelope: SignedEnvelope,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// Result of [`MessageStore::advance_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Advanced { from: MessageStatus, to: MessageStatus },
    /// Already at or beyond the target
    Unchanged(MessageStatus),
}

impl StatusChange {
    pub fn advanced(&self) -> bool {
        matches!(self, StatusChange::Advanced { .. })
    }
}

/// One page of a two-party history, oldest first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<MessageSummary>,
    pub total_count: usize,
    pub has_more: bool,
}

/// JSON view of a stored message as served over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: String,
    pub status: MessageStatus,
    pub message_hash: String,
    pub signature: crate::crypto::EnvelopeSignature,
    pub timestamp: String,
    pub created_at: DateTime<Utc>,
}

impl From<&StoredMessage> for MessageSummary {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            id: msg.id.clone(),
            from: msg.envelope.sender_username.clone(),
            to: msg.envelope.receiver_username.clone(),
            content: msg.envelope.plaintext_message.clone(),
            status: msg.status,
            message_hash: msg.envelope.message_hash.clone(),
            signature: msg.envelope.signature.clone(),
            timestamp: msg.envelope.timestamp.clone(),
            created_at: msg.created_at,
        }
    }
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reject backwards transitions before touching storage
pub(crate) fn check_transition(from: MessageStatus, to: MessageStatus) -> StoreResult<()> {
    if to < from {
        return Err(StoreError::InvalidTransition { from, to });
    }
    Ok(())
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message as `PENDING`, returning its id
    async fn create_message(&self, message: NewMessage) -> StoreResult<String>;

    /// Set `new` iff the current status equals `expected`. Returns whether the swap happened.
    async fn update_status(
        &self,
        id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> StoreResult<bool>;

    /// `PENDING` messages for a recipient, in creation order
    async fn list_pending(&self, receiver_id: &UserId) -> StoreResult<Vec<StoredMessage>>;

    async fn get(&self, id: &str) -> StoreResult<Option<StoredMessage>>;

    async fn count_all(&self) -> StoreResult<usize>;

    /// Newest first
    async fn recent(&self, limit: usize) -> StoreResult<Vec<StoredMessage>>;

    /// Messages exchanged between two users in either direction, oldest first
    async fn history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<HistoryPage>;

    /// Move forward to `target` unless already there or beyond
    async fn advance_status(&self, id: &str, target: MessageStatus) -> StoreResult<StatusChange> {
        loop {
            let current = self
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?
                .status;
            if current >= target {
                return Ok(StatusChange::Unchanged(current));
            }
            if self.update_status(id, current, target).await? {
                return Ok(StatusChange::Advanced { from: current, to: target });
            }
            // Lost a race with another transition; re-read and try again.
        }
    }

    /// Bulk `DELIVERED -> READ`, returning how many messages changed
    async fn mark_read(&self, ids: &[String]) -> StoreResult<usize> {
        let mut updated = 0;
        for id in ids {
            match self
                .update_status(id, MessageStatus::Delivered, MessageStatus::Read)
                .await
            {
                Ok(true) => updated += 1,
                Ok(false) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }
}
