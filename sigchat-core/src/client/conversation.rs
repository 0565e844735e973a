//! Conversation cache
//!
//! Client-resident history, one record per unordered pair of users, stored
//! under `chat_{min}_{max}`. Verification results are never trusted from
//! storage: loading a conversation puts every received signed message back
//! to `pending` so it is checked again against a fresh key.

use super::error::ConversationError;
use crate::crypto::{now_timestamp, SignedEnvelope};
use crate::protocol::MessageStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

pub type ConversationResult<T> = Result<T, ConversationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verifying,
    Verified,
    Failed,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Sent,
    Received,
    System,
    Error,
}

/// One entry of a conversation as the client shows and stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Local id, `msg_{uuid}`
    pub id: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub verification_status: VerificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_message: Option<SignedEnvelope>,
    /// Server-side delivery status, once the server has acknowledged the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Server record id, used for status updates and read receipts
    #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

pub fn new_local_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4())
}

impl ConversationMessage {
    pub fn sent(envelope: SignedEnvelope) -> Self {
        Self {
            kind: MessageKind::Sent,
            id: new_local_id(),
            content: envelope.plaintext_message.clone(),
            timestamp: envelope.timestamp.clone(),
            from: Some(envelope.sender_username.clone()),
            to: Some(envelope.receiver_username.clone()),
            verification_status: VerificationStatus::NotApplicable,
            signed_message: Some(envelope),
            status: None,
            server_id: None,
        }
    }

    pub fn received(envelope: SignedEnvelope, server_id: Option<String>) -> Self {
        Self {
            kind: MessageKind::Received,
            id: new_local_id(),
            content: envelope.plaintext_message.clone(),
            timestamp: envelope.timestamp.clone(),
            from: Some(envelope.sender_username.clone()),
            to: Some(envelope.receiver_username.clone()),
            verification_status: VerificationStatus::Pending,
            signed_message: Some(envelope),
            status: Some(MessageStatus::Delivered),
            server_id,
        }
    }

    pub fn notice(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            id: new_local_id(),
            content: content.into(),
            timestamp: now_timestamp(),
            from: None,
            to: None,
            verification_status: VerificationStatus::NotApplicable,
            signed_message: None,
            status: None,
            server_id: None,
        }
    }

    /// Only received messages carrying an envelope are ever verified
    pub fn is_verifiable(&self) -> bool {
        self.kind == MessageKind::Received && self.signed_message.is_some()
    }

    /// Move the delivery status forward; older statuses are ignored
    pub fn advance_status(&mut self, status: MessageStatus) -> bool {
        match self.status {
            Some(current) if current >= status => false,
            _ => {
                self.status = Some(status);
                true
            }
        }
    }
}

/// Commutative storage key for a pair of users
pub fn conversation_key(user_a: &str, user_b: &str) -> String {
    if user_a <= user_b {
        format!("chat_{}_{}", user_a, user_b)
    } else {
        format!("chat_{}_{}", user_b, user_a)
    }
}

/// What is persisted per conversation. Participants are stored explicitly
/// since usernames may themselves contain `_`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub participants: [String; 2],
    pub messages: Vec<ConversationMessage>,
}

impl ConversationRecord {
    pub fn new(user_a: &str, user_b: &str, messages: Vec<ConversationMessage>) -> Self {
        let mut participants = [user_a.to_string(), user_b.to_string()];
        participants.sort();
        Self { participants, messages }
    }

    /// The participant that is not `user`, if `user` takes part
    pub fn partner_of(&self, user: &str) -> Option<&str> {
        match &self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }
}

/// Key/value persistence for conversation records
pub trait ConversationStorage: Send + Sync {
    fn load(&self, key: &str) -> ConversationResult<Option<ConversationRecord>>;
    fn save(&self, key: &str, record: &ConversationRecord) -> ConversationResult<()>;
    /// Returns whether a record existed
    fn remove(&self, key: &str) -> ConversationResult<bool>;
    fn keys(&self) -> ConversationResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, ConversationRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ConversationRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConversationStorage for MemoryStorage {
    fn load(&self, key: &str) -> ConversationResult<Option<ConversationRecord>> {
        Ok(self.records().get(key).cloned())
    }

    fn save(&self, key: &str, record: &ConversationRecord) -> ConversationResult<()> {
        self.records().insert(key.to_string(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> ConversationResult<bool> {
        Ok(self.records().remove(key).is_some())
    }

    fn keys(&self) -> ConversationResult<Vec<String>> {
        Ok(self.records().keys().cloned().collect())
    }
}

/// One pretty-printed JSON file per conversation in a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> ConversationResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", key))
    }
}

impl ConversationStorage for FileStorage {
    fn load(&self, key: &str) -> ConversationResult<Option<ConversationRecord>> {
        match fs::read(self.record_path(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, record: &ConversationRecord) -> ConversationResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        // Write-then-rename so a crash never leaves a half-written record
        let tmp = self.base_path.join(format!("{}.json.tmp", key));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.record_path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> ConversationResult<bool> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> ConversationResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(key) = name.strip_suffix(".json") {
                if key.starts_with("chat_") {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}

#[derive(Clone)]
pub struct ConversationCache {
    storage: Arc<dyn ConversationStorage>,
}

impl ConversationCache {
    pub fn new(storage: Arc<dyn ConversationStorage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Store the whole ordered history. An empty slice is a no-op.
    pub fn save_messages(
        &self,
        user_a: &str,
        user_b: &str,
        messages: &[ConversationMessage],
    ) -> ConversationResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let key = conversation_key(user_a, user_b);
        self.storage
            .save(&key, &ConversationRecord::new(user_a, user_b, messages.to_vec()))?;
        debug!(%key, count = messages.len(), "Saved conversation");
        Ok(())
    }

    /// Load history with every received signed message reset to `pending`
    pub fn load_messages(&self, user_a: &str, user_b: &str) -> ConversationResult<Vec<ConversationMessage>> {
        let key = conversation_key(user_a, user_b);
        let Some(record) = self.storage.load(&key)? else {
            return Ok(Vec::new());
        };
        let mut messages = record.messages;
        for message in messages.iter_mut().filter(|m| m.is_verifiable()) {
            message.verification_status = VerificationStatus::Pending;
        }
        Ok(messages)
    }

    pub fn delete_conversation(&self, user_a: &str, user_b: &str) -> ConversationResult<bool> {
        self.storage.remove(&conversation_key(user_a, user_b))
    }

    /// Everyone `user` has a stored conversation with, sorted
    pub fn conversation_partners(&self, user: &str) -> ConversationResult<Vec<String>> {
        let mut partners = BTreeSet::new();
        for key in self.storage.keys()? {
            match self.storage.load(&key) {
                Ok(Some(record)) => {
                    if let Some(partner) = record.partner_of(user) {
                        partners.insert(partner.to_string());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "Skipping unreadable conversation"),
            }
        }
        Ok(partners.into_iter().collect())
    }
}
