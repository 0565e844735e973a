//! Public key cache
//!
//! Entries live for a fixed TTL (30s by default). Two invalidation paths:
//! - `invalidate(username)` when a new envelope from that sender arrives
//! - `invalidate_all()` on every new transport connection
//!
//! Fetches go through tickets. A ticket records the per-user and global
//! invalidation epochs at the moment the fetch started; `complete_fetch`
//! only stores the key if neither epoch moved in the meantime, so a slow
//! fetch cannot resurrect a key that was invalidated while it was in flight.

use super::jwk::EcJwk;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    key: EcJwk,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    user_epochs: HashMap<String, u64>,
    global_epoch: u64,
}

impl CacheState {
    fn user_epoch(&self, username: &str) -> u64 {
        self.user_epochs.get(username).copied().unwrap_or(0)
    }
}

/// Proof that a fetch started at a given point in the invalidation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    username: String,
    user_epoch: u64,
    global_epoch: u64,
}

impl FetchTicket {
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// TTL cache of sender public keys, shared by every verification task
#[derive(Debug)]
pub struct PublicKeyCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL)
    }
}

impl PublicKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // Nothing panics while holding this lock, but recover the state anyway.
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unexpired key for `username`
    pub fn get(&self, username: &str) -> Option<EcJwk> {
        let mut state = self.state();
        match state.entries.get(username) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.key.clone()),
            Some(_) => {
                trace!(username, "Cached key expired");
                state.entries.remove(username);
                None
            }
            None => None,
        }
    }

    /// Store a key unconditionally with a fresh TTL
    pub fn insert(&self, username: &str, key: EcJwk) {
        let expires_at = Instant::now() + self.ttl;
        self.state()
            .entries
            .insert(username.to_string(), CacheEntry { key, expires_at });
    }

    /// Record the start of a fetch for `username`
    pub fn begin_fetch(&self, username: &str) -> FetchTicket {
        let state = self.state();
        FetchTicket {
            username: username.to_string(),
            user_epoch: state.user_epoch(username),
            global_epoch: state.global_epoch,
        }
    }

    /// Store a fetched key unless the cache was invalidated since the ticket was issued.
    /// Returns whether the key was stored.
    pub fn complete_fetch(&self, ticket: FetchTicket, key: EcJwk) -> bool {
        let mut state = self.state();
        if state.global_epoch != ticket.global_epoch
            || state.user_epoch(&ticket.username) != ticket.user_epoch
        {
            trace!(username = %ticket.username, "Discarding fetch that raced an invalidation");
            return false;
        }
        let expires_at = Instant::now() + self.ttl;
        state
            .entries
            .insert(ticket.username, CacheEntry { key, expires_at });
        true
    }

    pub fn invalidate(&self, username: &str) {
        let mut state = self.state();
        state.entries.remove(username);
        *state.user_epochs.entry(username.to_string()).or_insert(0) += 1;
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.global_epoch += 1;
    }

    /// Number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key_pair;

    fn key(user: &str) -> EcJwk {
        derive_key_pair(user, "pw").unwrap().public_key
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = PublicKeyCache::new(Duration::from_secs(30));
        cache.insert("alice", key("alice"));
        assert!(cache.get("alice").is_some());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("alice").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("alice").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_single_entry() {
        let cache = PublicKeyCache::default();
        cache.insert("alice", key("alice"));
        cache.insert("bob", key("bob"));

        cache.invalidate("alice");
        assert!(cache.get("alice").is_none());
        assert!(cache.get("bob").is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = PublicKeyCache::default();
        cache.insert("alice", key("alice"));
        cache.insert("bob", key("bob"));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fetch_completes_without_invalidation() {
        let cache = PublicKeyCache::default();
        let ticket = cache.begin_fetch("alice");
        assert!(cache.complete_fetch(ticket, key("alice")));
        assert_eq!(cache.get("alice"), Some(key("alice")));
    }

    #[test]
    fn test_fetch_racing_user_invalidation_is_discarded() {
        let cache = PublicKeyCache::default();
        let ticket = cache.begin_fetch("alice");
        cache.invalidate("alice");
        assert!(!cache.complete_fetch(ticket, key("alice")));
        assert!(cache.get("alice").is_none());
    }

    #[test]
    fn test_fetch_racing_reconnect_is_discarded() {
        let cache = PublicKeyCache::default();
        let ticket = cache.begin_fetch("alice");
        cache.invalidate_all();
        assert!(!cache.complete_fetch(ticket, key("alice")));
    }

    #[test]
    fn test_other_user_invalidation_does_not_block_fetch() {
        let cache = PublicKeyCache::default();
        let ticket = cache.begin_fetch("alice");
        cache.invalidate("bob");
        assert!(cache.complete_fetch(ticket, key("alice")));
    }
}
