//! In-memory message store (non-persistent, for tests)

use super::{
    check_transition, new_message_id, HistoryPage, MessageStatus, MessageStore, MessageSummary,
    NewMessage, StoreError, StoreResult, StoredMessage,
};
use crate::identity::UserId;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    // Creation order is insertion order.
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn between(msg: &StoredMessage, a: &str, b: &str) -> bool {
    let (from, to) = (&msg.envelope.sender_username, &msg.envelope.receiver_username);
    (from == a && to == b) || (from == b && to == a)
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_message(&self, message: NewMessage) -> StoreResult<String> {
        let id = new_message_id();
        self.messages.write().await.push(StoredMessage {
            id: id.clone(),
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            envelope: message.envelope,
            status: MessageStatus::Pending,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> StoreResult<bool> {
        check_transition(expected, new)?;
        let mut messages = self.messages.write().await;
        let msg = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if msg.status != expected {
            return Ok(false);
        }
        msg.status = new;
        Ok(true)
    }

    async fn list_pending(&self, receiver_id: &UserId) -> StoreResult<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| &m.receiver_id == receiver_id && m.status == MessageStatus::Pending)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<StoredMessage>> {
        Ok(self.messages.read().await.iter().find(|m| m.id == id).cloned())
    }

    async fn count_all(&self) -> StoreResult<usize> {
        Ok(self.messages.read().await.len())
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn history(
        &self,
        user_a: &str,
        user_b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<HistoryPage> {
        let messages = self.messages.read().await;
        let matching: Vec<&StoredMessage> =
            messages.iter().filter(|m| between(m, user_a, user_b)).collect();
        let total_count = matching.len();
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(MessageSummary::from)
            .collect();
        Ok(HistoryPage {
            messages: page,
            total_count,
            has_more: offset.saturating_add(limit) < total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key_pair, sign_envelope_at, SignedEnvelope};
    use crate::store::StatusChange;

    fn envelope(from: &str, to: &str, text: &str) -> SignedEnvelope {
        let kp = derive_key_pair(from, "pw").unwrap();
        sign_envelope_at(from, to, text, "2024-01-01T00:00:00.000Z", &kp.private_key).unwrap()
    }

    fn new_message(from: &str, to: &str, text: &str) -> NewMessage {
        NewMessage {
            sender_id: UserId(format!("id-{}", from)),
            receiver_id: UserId(format!("id-{}", to)),
            envelope: envelope(from, to, text),
        }
    }

    #[tokio::test]
    async fn test_create_is_pending() {
        let store = MemoryMessageStore::new();
        let id = store.create_message(new_message("alice", "bob", "hi")).await.unwrap();
        let msg = store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.envelope.timestamp, "2024-01-01T00:00:00.000Z");
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryMessageStore::new();
        let id = store.create_message(new_message("alice", "bob", "hi")).await.unwrap();

        assert!(!store
            .update_status(&id, MessageStatus::Delivered, MessageStatus::Read)
            .await
            .unwrap());
        assert!(store
            .update_status(&id, MessageStatus::Pending, MessageStatus::Delivered)
            .await
            .unwrap());
        assert!(matches!(
            store.update_status(&id, MessageStatus::Read, MessageStatus::Delivered).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_message_ignores_later_delivered() {
        let store = MemoryMessageStore::new();
        let id = store.create_message(new_message("alice", "bob", "hi")).await.unwrap();
        store.advance_status(&id, MessageStatus::Read).await.unwrap();

        let change = store.advance_status(&id, MessageStatus::Delivered).await.unwrap();
        assert_eq!(change, StatusChange::Unchanged(MessageStatus::Read));
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_pending_in_creation_order() {
        let store = MemoryMessageStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .create_message(new_message("alice", "bob", &format!("m{}", i)))
                    .await
                    .unwrap(),
            );
        }
        store.create_message(new_message("alice", "carol", "other")).await.unwrap();
        store.advance_status(&ids[2], MessageStatus::Delivered).await.unwrap();

        let pending: Vec<String> = store
            .list_pending(&UserId("id-bob".to_string()))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(pending, vec![ids[0].clone(), ids[1].clone(), ids[3].clone(), ids[4].clone()]);
    }

    #[tokio::test]
    async fn test_history_and_recent() {
        let store = MemoryMessageStore::new();
        store.create_message(new_message("alice", "bob", "1")).await.unwrap();
        store.create_message(new_message("bob", "alice", "2")).await.unwrap();
        store.create_message(new_message("alice", "carol", "x")).await.unwrap();
        store.create_message(new_message("alice", "bob", "3")).await.unwrap();

        let page = store.history("bob", "alice", 2, 0).await.unwrap();
        assert_eq!(page.total_count, 3);
        assert!(page.has_more);
        assert_eq!(page.messages[0].content, "1");
        assert_eq!(page.messages[1].content, "2");

        let page = store.history("alice", "bob", 2, 2).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);

        let recent = store.recent(2).await.unwrap();
        assert_eq!(recent[0].envelope.plaintext_message, "3");
        assert_eq!(recent.len(), 2);

        let page = store.history("alice", "bob", usize::MAX, 1).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_mark_read_only_touches_delivered() {
        let store = MemoryMessageStore::new();
        let a = store.create_message(new_message("alice", "bob", "a")).await.unwrap();
        let b = store.create_message(new_message("alice", "bob", "b")).await.unwrap();
        store.advance_status(&a, MessageStatus::Delivered).await.unwrap();

        let updated = store
            .mark_read(&[a.clone(), b.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(store.get(&b).await.unwrap().unwrap().status, MessageStatus::Pending);
    }
}
