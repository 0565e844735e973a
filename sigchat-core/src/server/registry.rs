//! Who is currently connected
//!
//! One live connection per username. The registry is created when the
//! listener starts and injected into every connection task.
//!
//! Each username also has a route lock. Flushing a user's queue and routing a
//! new message to that user both hold it, so live messages never overtake
//! queued ones.

use super::error::DeliveryError;
use crate::protocol::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

pub type ConnId = u64;

/// Outbound side of one connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: ConnId,
    sender: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn new(conn_id: ConnId, sender: mpsc::Sender<ServerFrame>) -> Self {
        Self { conn_id, sender }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue a frame for the connection's writer task
    pub async fn send(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| DeliveryError::Transport(format!("connection {} closed", self.conn_id)))
    }

    /// Queue a frame without waiting. A full queue is `Backpressure`.
    pub fn try_send(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                DeliveryError::Backpressure(format!("connection {} queue full", self.conn_id))
            }
            TrySendError::Closed(_) => {
                DeliveryError::Transport(format!("connection {} closed", self.conn_id))
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    // One entry per username ever routed to; bounded by the directory
    routes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind `username` to a connection. Fails if another live connection holds it.
    pub async fn register(&self, username: &str, handle: ConnectionHandle) -> Result<(), DeliveryError> {
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(username) {
            if !existing.is_closed() && existing.conn_id != handle.conn_id {
                return Err(DeliveryError::AlreadyConnected(username.to_string()));
            }
            debug!(username, "Replacing closed connection entry");
        }
        info!(username, conn_id = handle.conn_id, "User connected");
        connections.insert(username.to_string(), handle);
        Ok(())
    }

    /// Remove `username` only if it is still bound to `conn_id`
    pub async fn unregister(&self, username: &str, conn_id: ConnId) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(username) {
            Some(handle) if handle.conn_id == conn_id => {
                connections.remove(username);
                info!(username, conn_id, "User disconnected");
                true
            }
            _ => false,
        }
    }

    /// Wait for exclusive routing rights to `username`
    pub async fn route_lock(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut routes = self.routes.lock().await;
            routes.entry(username.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn lookup(&self, username: &str) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .await
            .get(username)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Usernames with a live connection, sorted
    pub async fn online(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(registry: &ConnectionRegistry) -> (ConnectionHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(registry.next_conn_id(), tx), rx)
    }

    #[tokio::test]
    async fn test_one_connection_per_user() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(&registry);
        let (second, _rx2) = handle(&registry);

        registry.register("bob", first).await.unwrap();
        assert!(matches!(
            registry.register("bob", second).await,
            Err(DeliveryError::AlreadyConnected(_))
        ));
        assert_eq!(registry.online().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_only_owner() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(&registry);
        let first_id = first.conn_id();
        registry.register("bob", first).await.unwrap();

        assert!(!registry.unregister("bob", first_id + 100).await);
        assert!(registry.lookup("bob").await.is_some());
        assert!(registry.unregister("bob", first_id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_closed_connection_can_be_replaced() {
        let registry = ConnectionRegistry::new();
        let (first, rx1) = handle(&registry);
        registry.register("bob", first).await.unwrap();
        drop(rx1);

        assert!(registry.lookup("bob").await.is_none());
        let (second, _rx2) = handle(&registry);
        registry.register("bob", second).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let registry = ConnectionRegistry::new();
        let (h, mut rx) = handle(&registry);
        h.send(ServerFrame::system("hello")).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerFrame::system("hello")));
    }

    #[tokio::test]
    async fn test_try_send_reports_full_and_closed() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        let h = ConnectionHandle::new(registry.next_conn_id(), tx);

        h.try_send(ServerFrame::system("first")).unwrap();
        assert!(matches!(
            h.try_send(ServerFrame::system("second")),
            Err(DeliveryError::Backpressure(_))
        ));
        drop(rx);
        assert!(matches!(
            h.try_send(ServerFrame::system("third")),
            Err(DeliveryError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_route_lock_is_per_username() {
        let registry = ConnectionRegistry::new();
        let bob = registry.route_lock("bob").await;
        let wait = std::time::Duration::from_millis(100);

        // Another user is unaffected
        let carol = tokio::time::timeout(wait, registry.route_lock("carol")).await;
        assert!(carol.is_ok());

        let waiting = tokio::time::timeout(wait, registry.route_lock("bob")).await;
        assert!(waiting.is_err());

        drop(bob);
        let again = tokio::time::timeout(wait, registry.route_lock("bob")).await;
        assert!(again.is_ok());
    }
}
