//! axum listener: `GET /ws` for the delivery transport plus the HTTP API
//!
//! Each WebSocket gets one reader loop, which runs frames through the
//! [`DeliveryService`] strictly one after another, and one writer task fed by
//! the connection's outbound channel.

use super::api;
use super::delivery::{DeliveryService, Session};
use super::error::ServerError;
use super::registry::{ConnectionHandle, ConnectionRegistry};
use crate::config::ServerConfig;
use crate::identity::IdentityDirectory;
use crate::protocol::ServerFrame;
use crate::shutdown::ShutdownCoordinator;
use crate::store::MessageStore;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ConnectionLimits {
    active: AtomicUsize,
    max_connections: usize,
    outbound_buffer: usize,
}

/// Decrements the live socket count when a connection task ends
struct SocketSlot(Arc<ConnectionLimits>);

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Server state shared across requests and connections
#[derive(Clone)]
pub struct AppState {
    pub delivery: DeliveryService,
    pub directory: Arc<dyn IdentityDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub shutdown: Arc<ShutdownCoordinator>,
    limits: Arc<ConnectionLimits>,
}

impl AppState {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        store: Arc<dyn MessageStore>,
        shutdown: Arc<ShutdownCoordinator>,
        config: &ServerConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let delivery = DeliveryService::new(registry, directory.clone(), store.clone());
        Self {
            delivery,
            directory,
            store,
            shutdown,
            limits: Arc::new(ConnectionLimits {
                active: AtomicUsize::new(0),
                max_connections: config.max_connections,
                outbound_buffer: config.outbound_buffer.max(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.delivery.registry()
    }

    /// Live WebSocket connections, identified or not
    pub fn active_sockets(&self) -> usize {
        self.limits.active.load(Ordering::Acquire)
    }

    fn reserve_socket(&self) -> Option<SocketSlot> {
        let limits = &self.limits;
        let mut current = limits.active.load(Ordering::Acquire);
        loop {
            if current >= limits.max_connections {
                return None;
            }
            match limits.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SocketSlot(limits.clone())),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Build the router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Delivery transport
        .route("/ws", get(ws_upgrade))
        // HTTP API
        .route("/api/ping", get(api::ping))
        .route("/api/users/:username/publickey", get(api::public_key))
        .route("/api/messages", get(api::recent_messages))
        .route("/api/message/history", get(api::message_history))
        .route("/api/message/read", post(api::mark_read))
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(slot) = state.reserve_socket() else {
        warn!(max = state.limits.max_connections, "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, slot))
}

async fn handle_socket(socket: WebSocket, state: AppState, slot: SocketSlot) {
    let _slot = slot;
    let _guard = state.shutdown.track();
    let mut shutdown_rx = state.shutdown.subscribe();

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.limits.outbound_buffer);
    let conn_id = state.registry().next_conn_id();
    debug!(conn_id, "WebSocket opened");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_text())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(ConnectionHandle::new(conn_id, tx));
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => state.delivery.handle_text(&mut session, &text).await,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => state.delivery.handle_text(&mut session, &text).await,
                    Err(_) => state.delivery.handle_text(&mut session, "").await,
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id, error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                let _ = session.handle().send(ServerFrame::system("Server shutting down")).await;
                break;
            }
        }
    }

    state.delivery.disconnect(&session).await;
    drop(session);
    let _ = writer.await;
    debug!(conn_id, "WebSocket closed");
}

/// Bound listener, ready to serve
pub struct SigchatServer {
    listener: TcpListener,
    state: AppState,
}

impl SigchatServer {
    pub async fn bind(addr: &str, state: AppState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown coordinator fires
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        let shutdown = self.state.shutdown.clone();
        let router = build_router(self.state);

        info!(%addr, "Delivery server listening");
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await?;
        info!("Delivery server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key_pair;
    use crate::identity::MemoryDirectory;
    use crate::store::MemoryMessageStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn state() -> AppState {
        let directory = Arc::new(MemoryDirectory::new());
        let kp = derive_key_pair("alice", "pw").unwrap();
        directory.register_user("alice", &kp.public_key).await.unwrap();
        AppState::new(
            directory,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(ShutdownCoordinator::new(Duration::from_secs(1))),
            &ServerConfig::default(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ping_counts_users() {
        let app = build_router(state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["userCount"], 1);
    }

    #[tokio::test]
    async fn test_public_key_lookup() {
        let app = build_router(state().await);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/users/alice/publickey")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["username"], "alice");
        assert_eq!(body["publicKey"]["crv"], "secp256k1");
        assert!(body["publicKey"].get("d").is_none());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/users/nobody/publickey")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_requires_both_users() {
        let app = build_router(state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/message/history?user1=alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_with_huge_paging_values() {
        let app = build_router(state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/api/message/history?user1=alice&user2=bob&limit={}&offset={}",
                        usize::MAX,
                        usize::MAX
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["totalCount"], 0);
        assert_eq!(body["hasMore"], false);
    }

    #[tokio::test]
    async fn test_mark_read_rejects_empty() {
        let app = build_router(state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/message/read")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messageIds":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recent_messages_empty() {
        let app = build_router(state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["count"], 0);
    }

    #[tokio::test]
    async fn test_socket_limit() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let state = AppState::new(
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(ShutdownCoordinator::new(Duration::from_secs(1))),
            &config,
        );
        let first = state.reserve_socket();
        assert!(first.is_some());
        assert!(state.reserve_socket().is_none());
        drop(first);
        assert_eq!(state.active_sockets(), 0);
        assert!(state.reserve_socket().is_some());
    }
}
