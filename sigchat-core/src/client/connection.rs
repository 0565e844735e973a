//! Client side of the delivery transport
//!
//! ```text
//!   Disconnected ──► Connecting ──► Identifying ──► Active
//!        ▲                                            │
//!        └──────── close / error, retry after delay ──┘
//! ```
//!
//! One background task owns the socket. It sends `identify` on every new
//! socket, reports [`ConnectionEvent::Connected`] so the key cache can be
//! dropped, forwards parsed server frames, and reconnects after a fixed delay
//! for as long as the shutdown coordinator allows.

use super::error::TransportError;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new socket is open and `identify` has been sent
    Connected,
    Frame(ServerFrame),
    Disconnected { reason: String },
}

/// Anything client frames can be pushed into
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub username: String,
    pub reconnect_delay: Duration,
    pub outbound_buffer: usize,
}

impl ConnectionOptions {
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            reconnect_delay: Duration::from_secs(3),
            outbound_buffer: 64,
        }
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

type OutboundSlot = Arc<RwLock<Option<mpsc::Sender<ClientFrame>>>>;

/// Handle to the background connection task
#[derive(Clone)]
pub struct ClientConnection {
    state: watch::Receiver<ConnectionState>,
    outbound: OutboundSlot,
}

impl ClientConnection {
    /// Start connecting. Events arrive on the returned receiver until the
    /// shutdown coordinator fires or the receiver is dropped.
    pub fn spawn(
        options: ConnectionOptions,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::channel(256);
        let outbound: OutboundSlot = Arc::new(RwLock::new(None));

        let worker = ConnectionLoop {
            options,
            state: state_tx,
            outbound: outbound.clone(),
            events: event_tx,
            shutdown,
        };
        let task = tokio::spawn(worker.run());

        (ClientConnection { state: state_rx, outbound }, event_rx, task)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a frame on the live socket. Fails unless `Active`.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Active {
            return Err(TransportError::NotConnected);
        }
        let sender = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        sender.send(frame).await.map_err(|_| TransportError::NotConnected)
    }
}

#[async_trait]
impl Outbox for ClientConnection {
    async fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.send(frame).await
    }
}

enum SocketEnd {
    Lost(String),
    Stop,
}

struct ConnectionLoop {
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    outbound: OutboundSlot,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ConnectionLoop {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(self) {
        let _guard = self.shutdown.track();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_shutting_down().await {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            debug!(url = %self.options.url, "Connecting");
            let end = match connect_async(self.options.url.as_str()).await {
                Ok((socket, _)) => self.serve(socket, &mut shutdown_rx).await,
                Err(e) => SocketEnd::Lost(TransportError::Connect(e.to_string()).to_string()),
            };
            self.set_state(ConnectionState::Disconnected);

            match end {
                SocketEnd::Stop => break,
                SocketEnd::Lost(reason) => {
                    warn!(
                        %reason,
                        retry_in = ?self.options.reconnect_delay,
                        "Connection lost"
                    );
                    if self
                        .events
                        .send(ConnectionEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Connection task stopped");
    }

    async fn serve(
        &self,
        socket: Socket,
        shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> SocketEnd {
        let (mut sink, mut stream) = socket.split();

        self.set_state(ConnectionState::Identifying);
        let identify = ClientFrame::Identify {
            username: self.options.username.clone(),
        };
        if let Err(e) = sink.send(Message::Text(identify.to_text())).await {
            return SocketEnd::Lost(e.to_string());
        }

        let (tx, mut rx) = mpsc::channel(self.options.outbound_buffer.max(1));
        *self.outbound.write().await = Some(tx);
        self.set_state(ConnectionState::Active);
        info!(url = %self.options.url, username = %self.options.username, "Connected");

        let end = if self.events.send(ConnectionEvent::Connected).await.is_err() {
            SocketEnd::Stop
        } else {
            loop {
                tokio::select! {
                    Some(frame) = rx.recv() => {
                        if let Err(e) = sink.send(Message::Text(frame.to_text())).await {
                            break SocketEnd::Lost(TransportError::Send(e.to_string()).to_string());
                        }
                    }
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match ServerFrame::parse(&text) {
                            Ok(frame) => {
                                if self.events.send(ConnectionEvent::Frame(frame)).await.is_err() {
                                    break SocketEnd::Stop;
                                }
                            }
                            Err(e) => warn!(error = %e, "Dropping malformed server frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            break SocketEnd::Lost(TransportError::Closed.to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break SocketEnd::Lost(e.to_string()),
                    },
                    _ = shutdown_rx.recv() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break SocketEnd::Stop;
                    }
                }
            }
        };

        *self.outbound.write().await = None;
        end
    }
}
