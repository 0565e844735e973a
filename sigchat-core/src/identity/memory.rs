//! In-memory identity directory for tests and single-process setups

use super::{check_public_key, validate_username, IdentityDirectory, IdentityError, PublicKeyRecord, UserId};
use crate::crypto::EcJwk;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<String, UserId>,
    keys: HashMap<String, Vec<PublicKeyRecord>>,
    next_key_id: i64,
}

impl DirectoryState {
    fn user(&self, username: &str) -> Result<&UserId, IdentityError> {
        self.users
            .get(username)
            .ok_or_else(|| IdentityError::UnknownUser(username.to_string()))
    }

    fn push_key(&mut self, username: &str, user_id: UserId, jwk: EcJwk) -> Result<PublicKeyRecord, IdentityError> {
        let fingerprint = jwk
            .fingerprint()
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        self.next_key_id += 1;
        let record = PublicKeyRecord {
            id: self.next_key_id,
            user_id,
            jwk,
            fingerprint,
            is_active: true,
            created_at: Utc::now(),
        };
        let keys = self.keys.entry(username.to_string()).or_default();
        for key in keys.iter_mut() {
            key.is_active = false;
        }
        keys.push(record.clone());
        Ok(record)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn resolve_user_id(&self, username: &str) -> Result<UserId, IdentityError> {
        self.state.read().await.user(username).cloned()
    }

    async fn active_key(&self, username: &str) -> Result<PublicKeyRecord, IdentityError> {
        let state = self.state.read().await;
        state.user(username)?;
        state
            .keys
            .get(username)
            .and_then(|keys| keys.iter().find(|k| k.is_active))
            .cloned()
            .ok_or_else(|| IdentityError::NoActiveKey(username.to_string()))
    }

    async fn user_count(&self) -> Result<usize, IdentityError> {
        Ok(self.state.read().await.users.len())
    }

    async fn register_user(&self, username: &str, public_key: &EcJwk) -> Result<UserId, IdentityError> {
        validate_username(username)?;
        let jwk = check_public_key(public_key)?;

        let mut state = self.state.write().await;
        if state.users.contains_key(username) {
            return Err(IdentityError::UsernameTaken(username.to_string()));
        }
        let user_id = UserId::generate();
        state.push_key(username, user_id.clone(), jwk)?;
        state.users.insert(username.to_string(), user_id.clone());
        Ok(user_id)
    }

    async fn add_public_key(
        &self,
        username: &str,
        public_key: &EcJwk,
    ) -> Result<PublicKeyRecord, IdentityError> {
        let jwk = check_public_key(public_key)?;
        let mut state = self.state.write().await;
        let user_id = state.user(username)?.clone();
        state.push_key(username, user_id, jwk)
    }

    async fn deactivate_key(&self, username: &str, key_id: i64) -> Result<(), IdentityError> {
        let mut state = self.state.write().await;
        state.user(username)?;
        let key = state
            .keys
            .get_mut(username)
            .and_then(|keys| keys.iter_mut().find(|k| k.id == key_id))
            .ok_or(IdentityError::KeyNotFound(key_id))?;
        key.is_active = false;
        Ok(())
    }

    async fn list_keys(&self, username: &str) -> Result<Vec<PublicKeyRecord>, IdentityError> {
        let state = self.state.read().await;
        state.user(username)?;
        Ok(state.keys.get(username).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key_pair;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let dir = MemoryDirectory::new();
        let kp = derive_key_pair("alice", "pw").unwrap();
        let id = dir.register_user("alice", &kp.public_key).await.unwrap();

        assert_eq!(dir.resolve_user_id("alice").await.unwrap(), id);
        assert_eq!(dir.resolve_public_key("alice").await.unwrap(), kp.public_key);
        assert_eq!(dir.user_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_username_rejected() {
        let dir = MemoryDirectory::new();
        let kp = derive_key_pair("alice", "pw").unwrap();
        dir.register_user("alice", &kp.public_key).await.unwrap();
        assert!(matches!(
            dir.register_user("alice", &kp.public_key).await,
            Err(IdentityError::UsernameTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_usernames_are_case_sensitive() {
        let dir = MemoryDirectory::new();
        let kp = derive_key_pair("alice", "pw").unwrap();
        dir.register_user("alice", &kp.public_key).await.unwrap();
        dir.register_user("Alice", &kp.public_key).await.unwrap();
        assert_eq!(dir.user_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_key_becomes_only_active() {
        let dir = MemoryDirectory::new();
        let k1 = derive_key_pair("alice", "one").unwrap();
        let k2 = derive_key_pair("alice", "two").unwrap();
        dir.register_user("alice", &k1.public_key).await.unwrap();
        dir.add_public_key("alice", &k2.public_key).await.unwrap();

        assert_eq!(dir.resolve_public_key("alice").await.unwrap(), k2.public_key);
        let keys = dir.list_keys("alice").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.iter().filter(|k| k.is_active).count(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_leaves_no_active_key() {
        let dir = MemoryDirectory::new();
        let kp = derive_key_pair("alice", "pw").unwrap();
        dir.register_user("alice", &kp.public_key).await.unwrap();
        let key = dir.active_key("alice").await.unwrap();

        dir.deactivate_key("alice", key.id).await.unwrap();
        assert!(matches!(
            dir.resolve_public_key("alice").await,
            Err(IdentityError::NoActiveKey(_))
        ));
        assert!(matches!(
            dir.deactivate_key("alice", 999).await,
            Err(IdentityError::KeyNotFound(999))
        ));
    }
}
