//! Public key cache behavior as seen through the verifier

use async_trait::async_trait;
use sigchat_core::crypto::{
    derive_key_pair, sign_envelope_at, EcJwk, KeyResolutionError, KeySource, PublicKeyCache,
    Verifier,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Serves keys from a map and counts fetches
#[derive(Default)]
struct CountingSource {
    keys: Mutex<HashMap<String, EcJwk>>,
    fetches: AtomicUsize,
}

impl CountingSource {
    fn with_user(username: &str, passphrase: &str) -> Arc<Self> {
        let source = Arc::new(Self::default());
        source.set(username, passphrase);
        source
    }

    fn set(&self, username: &str, passphrase: &str) {
        let key = derive_key_pair(username, passphrase).unwrap().public_key;
        self.keys.lock().unwrap().insert(username.to_string(), key);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for CountingSource {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.keys
            .lock()
            .unwrap()
            .get(username)
            .cloned()
            .ok_or_else(|| KeyResolutionError::NotFound(username.to_string()))
    }
}

/// Holds every fetch until released
struct GatedSource {
    inner: Arc<CountingSource>,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl KeySource for GatedSource {
    async fn fetch_public_key(&self, username: &str) -> Result<EcJwk, KeyResolutionError> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.fetch_public_key(username).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cached_key_reused_within_ttl() {
    let source = CountingSource::with_user("alice", "pw");
    let verifier = Verifier::new(source.clone(), Arc::new(PublicKeyCache::default()));

    verifier.resolve_key("alice", false).await.unwrap();
    tokio::time::advance(Duration::from_secs(29)).await;
    verifier.resolve_key("alice", false).await.unwrap();
    assert_eq!(source.fetches(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    verifier.resolve_key("alice", false).await.unwrap();
    assert_eq!(source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_forced_refresh_always_fetches() {
    let source = CountingSource::with_user("alice", "pw");
    let verifier = Verifier::new(source.clone(), Arc::new(PublicKeyCache::default()));

    for expected in 1..=3 {
        verifier.resolve_key("alice", true).await.unwrap();
        assert_eq!(source.fetches(), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_rotated_key_seen_after_invalidation() {
    let source = CountingSource::with_user("alice", "old");
    let cache = Arc::new(PublicKeyCache::default());
    let verifier = Verifier::new(source.clone(), cache.clone());

    let new_kp = derive_key_pair("alice", "new").unwrap();
    let envelope =
        sign_envelope_at("alice", "bob", "hi", "2025-01-01T12:00:00.000Z", &new_kp.private_key).unwrap();

    assert!(!verifier.verify(&envelope, false).await);
    source.set("alice", "new");

    // The stale key is still cached
    assert!(!verifier.verify(&envelope, false).await);

    cache.invalidate("alice");
    assert!(verifier.verify(&envelope, false).await);
}

#[tokio::test]
async fn test_invalidation_during_fetch_is_not_overwritten() {
    let inner = CountingSource::with_user("alice", "pw");
    let gated = Arc::new(GatedSource {
        inner,
        started: Notify::new(),
        release: Notify::new(),
    });
    let cache = Arc::new(PublicKeyCache::default());
    let verifier = Verifier::new(gated.clone(), cache.clone());

    let pending = tokio::spawn({
        let verifier = verifier.clone();
        async move { verifier.resolve_key("alice", false).await }
    });
    gated.started.notified().await;

    cache.invalidate("alice");
    gated.release.notify_one();

    // The in-flight caller still gets its snapshot
    let key = pending.await.unwrap().unwrap();
    assert_eq!(key, derive_key_pair("alice", "pw").unwrap().public_key);
    assert!(cache.get("alice").is_none());
}

#[tokio::test]
async fn test_global_invalidation_during_fetch_is_not_overwritten() {
    let inner = CountingSource::with_user("alice", "pw");
    let gated = Arc::new(GatedSource {
        inner,
        started: Notify::new(),
        release: Notify::new(),
    });
    let cache = Arc::new(PublicKeyCache::default());
    let verifier = Verifier::new(gated.clone(), cache.clone());

    let pending = tokio::spawn({
        let verifier = verifier.clone();
        async move { verifier.resolve_key("alice", true).await }
    });
    gated.started.notified().await;

    cache.invalidate_all();
    gated.release.notify_one();

    assert!(pending.await.unwrap().is_ok());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_unknown_sender_fails_verification() {
    let source = Arc::new(CountingSource::default());
    let verifier = Verifier::new(source, Arc::new(PublicKeyCache::default()));
    let kp = derive_key_pair("ghost", "pw").unwrap();
    let envelope =
        sign_envelope_at("ghost", "bob", "boo", "2025-01-01T12:00:00.000Z", &kp.private_key).unwrap();

    assert!(!verifier.verify(&envelope, true).await);
    assert!(matches!(
        verifier.verify_detailed(&envelope, true).await,
        Err(sigchat_core::crypto::VerificationError::KeyResolution(KeyResolutionError::NotFound(_)))
    ));
}
